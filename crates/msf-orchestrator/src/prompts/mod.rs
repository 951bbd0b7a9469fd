use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::error;

use crate::dispatch::Role;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(.*?)\}").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("{} file is absent", .0.display())]
    Missing(PathBuf),
    #[error("the file {} is empty", .0.display())]
    Empty(PathBuf),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// System messages per role, read from `<dir>/<entry>.txt`.
///
/// Entries may carry a version suffix (`team_lead#2`); the role key is the
/// part before `#`. `{NAME}` placeholders are filled from `replacements` and
/// left untouched when no replacement exists.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    dir: PathBuf,
    extension: String,
    replacements: HashMap<String, String>,
    messages: HashMap<String, Option<String>>,
}

impl PromptLibrary {
    pub fn new(dir: impl Into<PathBuf>, replacements: HashMap<String, String>) -> Self {
        Self {
            dir: dir.into(),
            extension: "txt".to_string(),
            replacements,
            messages: HashMap::new(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Loads every entry and returns the problems met on the way, already
    /// logged. A missing file is only tolerated for bootstrap roles.
    pub fn load(&mut self, entries: &[&str]) -> Vec<PromptError> {
        let mut problems = Vec::new();
        for &entry in entries {
            let key = entry.split('#').next().unwrap_or(entry).to_string();
            let path = self.dir.join(format!("{entry}.{}", self.extension));
            let message = match self.read_prompt(&path) {
                Ok(message) => Some(message),
                Err(PromptError::Missing(_))
                    if Role::from_key(&key).is_some_and(Role::is_bootstrap) =>
                {
                    None
                }
                Err(e) => {
                    error!(role = %key, error = %e, "prompt not loaded");
                    problems.push(e);
                    None
                }
            };
            self.messages.insert(key, message);
        }
        problems
    }

    fn read_prompt(&self, path: &Path) -> Result<String, PromptError> {
        let raw = fs::read_to_string(path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => PromptError::Missing(path.to_path_buf()),
            _ => PromptError::Io {
                path: path.to_path_buf(),
                source,
            },
        })?;
        let joined = raw.lines().map(str::trim).collect::<Vec<_>>().join(" ");
        if joined.trim().is_empty() {
            return Err(PromptError::Empty(path.to_path_buf()));
        }
        Ok(self.replace_placeholders(&joined))
    }

    fn replace_placeholders(&self, text: &str) -> String {
        PLACEHOLDER
            .replace_all(text, |caps: &Captures| {
                self.replacements
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    pub fn system_message(&self, key: &str) -> &str {
        self.messages
            .get(key)
            .and_then(|m| m.as_deref())
            .unwrap_or("")
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.messages.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs};

    use super::{PromptError, PromptLibrary};

    fn library(dir: &tempfile::TempDir) -> PromptLibrary {
        let replacements = HashMap::from([(
            "AUXILIARY_MODULES".to_string(),
            "scanner/portscan/tcp, scanner/http/http_version".to_string(),
        )]);
        PromptLibrary::new(dir.path(), replacements)
    }

    #[test]
    fn loads_versioned_prompt_and_fills_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("pentest#3.txt"),
            "  You are the pentest agent.\nAllowed modules: {AUXILIARY_MODULES}.\n  Keep {UNKNOWN} as is.\n",
        )
        .unwrap();

        let mut prompts = library(&dir);
        let problems = prompts.load(&["pentest#3"]);

        assert!(problems.is_empty());
        assert_eq!(
            prompts.system_message("pentest"),
            "You are the pentest agent. Allowed modules: scanner/portscan/tcp, scanner/http/http_version. Keep {UNKNOWN} as is."
        );
    }

    #[test]
    fn missing_prompt_is_fine_only_for_bootstrap_roles() {
        let dir = tempfile::tempdir().unwrap();
        let mut prompts = library(&dir);
        let problems = prompts.load(&["executor", "initializer", "team_lead#2"]);

        assert_eq!(problems.len(), 1);
        assert!(matches!(&problems[0], PromptError::Missing(p) if p.ends_with("team_lead#2.txt")));
        assert_eq!(prompts.system_message("team_lead"), "");
        assert_eq!(prompts.roles().count(), 3);
    }

    #[test]
    fn empty_prompt_is_always_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("executor.txt"), "\n   \n").unwrap();
        let mut prompts = library(&dir);
        let problems = prompts.load(&["executor"]);

        assert!(matches!(&problems[..], [PromptError::Empty(_)]));
        assert_eq!(prompts.system_message("executor"), "");
    }
}
