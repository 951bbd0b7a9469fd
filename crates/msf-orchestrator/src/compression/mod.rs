use std::{collections::HashMap, fmt};

use regex::Regex;

/// Port-like number after a colon, e.g. `10.0.0.1:443`.
pub const DEFAULT_TOKEN_PATTERN: &str = r":(\d{1,5})\b";
pub const DEFAULT_TRIGGER_PATTERN: &str = r"\[\*\]";
pub const DEFAULT_MIN_LINES: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionUnit {
    prefix: String,
    suffix: String,
    tokens: Vec<String>,
    occurrences: usize,
    first_seen: usize,
}

impl CompressionUnit {
    fn new(prefix: &str, suffix: &str, first_seen: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            tokens: Vec::new(),
            occurrences: 0,
            first_seen,
        }
    }

    fn observe(&mut self, token: &str) {
        self.occurrences += 1;
        if !self.tokens.iter().any(|t| t == token) {
            self.tokens.push(token.to_string());
        }
    }

    pub fn template(&self) -> String {
        format!("{}{{}}{}", self.prefix, self.suffix)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn count(&self) -> usize {
        self.tokens.len()
    }

    pub fn occurrences(&self) -> usize {
        self.occurrences
    }

    pub fn first_seen(&self) -> usize {
        self.first_seen
    }

    fn render(&self) -> String {
        match self.tokens.as_slice() {
            [only] => format!("{}{}{}", self.prefix, only, self.suffix),
            tokens => format!(
                "{}{{{}}}{} ({})",
                self.prefix,
                enumerate_tokens(tokens),
                self.suffix,
                tokens.len()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Line(String),
    Unit(CompressionUnit),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressedOutput {
    entries: Vec<Entry>,
    input_lines: usize,
}

impl CompressedOutput {
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn units(&self) -> impl Iterator<Item = &CompressionUnit> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Unit(unit) => Some(unit),
            Entry::Line(_) => None,
        })
    }

    pub fn input_lines(&self) -> usize {
        self.input_lines
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CompressedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            match entry {
                Entry::Line(line) => f.write_str(line)?,
                Entry::Unit(unit) => f.write_str(&unit.render())?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Compressor {
    token_pattern: Regex,
    min_lines: usize,
    trigger_patterns: Vec<Regex>,
}

impl Compressor {
    pub fn new(
        token_pattern: &str,
        min_lines: usize,
        trigger_patterns: &[String],
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            token_pattern: Regex::new(token_pattern)?,
            min_lines,
            trigger_patterns: trigger_patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Compress when there are more than `min_lines` lines or any line
    /// matches a trigger pattern.
    pub fn should_compress(&self, text: &str) -> bool {
        let mut lines = 0;
        for line in text.lines() {
            lines += 1;
            if self.trigger_patterns.iter().any(|p| p.is_match(line)) {
                return true;
            }
        }
        lines > self.min_lines
    }

    pub fn compress(&self, text: &str) -> CompressedOutput {
        let mut out = CompressedOutput::default();
        let mut by_template: HashMap<(String, String), usize> = HashMap::new();

        for (index, line) in text.lines().enumerate() {
            out.input_lines += 1;
            let Some((prefix, token, suffix)) = self.split_line(line) else {
                out.entries.push(Entry::Line(line.to_string()));
                continue;
            };
            let slot = *by_template
                .entry((prefix.to_string(), suffix.to_string()))
                .or_insert_with(|| {
                    out.entries
                        .push(Entry::Unit(CompressionUnit::new(prefix, suffix, index)));
                    out.entries.len() - 1
                });
            if let Entry::Unit(unit) = &mut out.entries[slot] {
                unit.observe(token);
            }
        }
        out
    }

    /// Last match of the token pattern wins; group 1 if the pattern has one.
    fn split_line<'a>(&self, line: &'a str) -> Option<(&'a str, &'a str, &'a str)> {
        let caps = self.token_pattern.captures_iter(line).last()?;
        let m = caps.get(1).or_else(|| caps.get(0))?;
        if m.as_str().is_empty() {
            return None;
        }
        Some((&line[..m.start()], m.as_str(), &line[m.end()..]))
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(
            DEFAULT_TOKEN_PATTERN,
            DEFAULT_MIN_LINES,
            &[DEFAULT_TRIGGER_PATTERN.to_string()],
        )
        .expect("default compression patterns compile")
    }
}

fn as_number(token: &str) -> Option<u64> {
    let n: u64 = token.parse().ok()?;
    // "007" would come back as "7"
    (n.to_string() == token).then_some(n)
}

/// `20,21,22,80,x` -> `20-22,80,x`. Only neighbours in first-seen order
/// collapse, so the listing keeps the scanner's ordering.
fn enumerate_tokens(tokens: &[String]) -> String {
    let mut parts = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let Some(start) = as_number(&tokens[i]) else {
            parts.push(tokens[i].clone());
            i += 1;
            continue;
        };
        let mut end = start;
        let mut j = i + 1;
        while j < tokens.len() {
            match (as_number(&tokens[j]), end.checked_add(1)) {
                (Some(next), Some(expected)) if next == expected => {
                    end = next;
                    j += 1;
                }
                _ => break,
            }
        }
        if end > start {
            parts.push(format!("{start}-{end}"));
        } else {
            parts.push(start.to_string());
        }
        i = j;
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::{enumerate_tokens, Compressor, Entry};

    fn open_port_lines(ports: impl IntoIterator<Item = u16>) -> String {
        ports
            .into_iter()
            .map(|p| format!("[+] 63.251.228.70:      - 63.251.228.70:{p} - TCP OPEN\n"))
            .collect()
    }

    #[test]
    fn sequential_ports_collapse_to_one_shorter_line() {
        let raw = open_port_lines(20..31);
        let compressed = Compressor::default().compress(&raw);
        let rendered = compressed.render();

        assert_eq!(compressed.units().count(), 1);
        assert_eq!(
            rendered,
            "[+] 63.251.228.70:      - 63.251.228.70:{20-30} - TCP OPEN (11)"
        );
        assert!(rendered.len() < raw.len());
    }

    #[test]
    fn every_token_and_unmatched_line_survives() {
        let raw = "[*] Scanning host\n\
                   [+] 10.0.0.1:22 - TCP OPEN\n\
                   [+] 10.0.0.1:80 - TCP OPEN\n\
                   banner without port\n\
                   [+] 10.0.0.1:443 - TCP OPEN\n\
                   [+] 10.0.0.1:80 - TCP OPEN\n\
                   [*] Auxiliary module execution completed\n";
        let compressed = Compressor::default().compress(raw);

        let entries = compressed.entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0], Entry::Line("[*] Scanning host".into()));
        assert_eq!(entries[2], Entry::Line("banner without port".into()));
        assert_eq!(
            entries[3],
            Entry::Line("[*] Auxiliary module execution completed".into())
        );

        let unit = compressed.units().next().expect("one unit");
        assert_eq!(unit.template(), "[+] 10.0.0.1:{} - TCP OPEN");
        assert_eq!(unit.tokens(), ["22", "80", "443"]);
        assert_eq!(unit.count(), 3);
        assert_eq!(unit.occurrences(), 4);
        assert_eq!(unit.first_seen(), 1);

        let rendered = compressed.render();
        for token in ["22", "80", "443"] {
            assert!(rendered.contains(token));
        }
        assert!(rendered.contains("banner without port"));
    }

    #[test]
    fn templates_differing_elsewhere_stay_apart() {
        let raw = "[+] 10.0.0.1:22 - TCP OPEN\n[+] 10.0.0.2:22 - TCP OPEN\n";
        let compressed = Compressor::default().compress(raw);
        assert_eq!(compressed.units().count(), 2);
        assert_eq!(compressed.render(), raw.trim_end());
    }

    #[test]
    fn ranges_only_join_consecutive_neighbours() {
        let tokens: Vec<String> = ["21", "22", "23", "80", "8080", "8081", "ssh", "007"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(enumerate_tokens(&tokens), "21-23,80,8080-8081,ssh,007");
    }

    #[test]
    fn trigger_is_line_count_or_pattern() {
        let compressor = Compressor::new(r":(\d+)", 3, &[r"\[\*\]".to_string()]).unwrap();
        assert!(!compressor.should_compress("a\nb\nc"));
        assert!(compressor.should_compress("a\nb\nc\nd"));
        assert!(compressor.should_compress("[*] one line"));
        assert!(!compressor.should_compress(""));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        assert!(Compressor::new("(", 10, &[]).is_err());
    }
}
