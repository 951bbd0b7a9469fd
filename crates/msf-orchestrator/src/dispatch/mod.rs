use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::ScanRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initializer,
    TeamLead,
    Pentest,
    TaskSupervisor,
    Helper,
    Executor,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initializer => "initializer",
            Role::TeamLead => "team_lead",
            Role::Pentest => "pentest",
            Role::TaskSupervisor => "task_supervisor",
            Role::Helper => "helper",
            Role::Executor => "executor",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        [
            Role::Initializer,
            Role::TeamLead,
            Role::Pentest,
            Role::TaskSupervisor,
            Role::Helper,
            Role::Executor,
        ]
        .into_iter()
        .find(|role| role.as_str() == key)
    }

    pub fn is_bootstrap(self) -> bool {
        matches!(self, Role::Initializer | Role::Executor)
    }

    pub fn is_worker(self) -> bool {
        matches!(self, Role::Pentest | Role::Helper)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub speaker: Role,
    pub content: String,
    pub tool_request: Option<ScanRequest>,
}

impl Turn {
    pub fn new(speaker: Role, content: impl Into<String>) -> Self {
        Self {
            speaker,
            content: content.into(),
            tool_request: None,
        }
    }

    pub fn with_tool_request(mut self, request: ScanRequest) -> Self {
        self.tool_request = Some(request);
        self
    }

    pub fn issued_tool_call(&self) -> bool {
        self.tool_request.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn speaker_before_last(&self, n: usize) -> Option<Role> {
        let idx = self.turns.len().checked_sub(n + 1)?;
        Some(self.turns[idx].speaker)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pipeline {
    Supervised,
    Delegating,
}

impl Pipeline {
    pub fn roles(self) -> &'static [Role] {
        match self {
            Pipeline::Supervised => &[
                Role::Initializer,
                Role::TeamLead,
                Role::Pentest,
                Role::TaskSupervisor,
                Role::Executor,
            ],
            Pipeline::Delegating => &[
                Role::Initializer,
                Role::TeamLead,
                Role::Pentest,
                Role::TaskSupervisor,
                Role::Helper,
                Role::Executor,
            ],
        }
    }

    pub fn contains(self, role: Role) -> bool {
        self.roles().contains(&role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPhrases {
    pub pentest: String,
    pub helper: String,
    pub supervisor: String,
    pub rework: String,
    pub approve: String,
}

impl Default for RoutingPhrases {
    fn default() -> Self {
        Self {
            pentest: "Pentest".to_string(),
            helper: "Helper agent".to_string(),
            supervisor: "Task Supervisor".to_string(),
            rework: "Pentest Agent, rework required".to_string(),
            approve: "Team Lead, task completed satisfactorily".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Always,
    ToolCall,
    Mentions(String),
}

impl Condition {
    fn mentions(phrase: &str) -> Self {
        Condition::Mentions(phrase.to_lowercase())
    }

    fn holds(&self, turn: &Turn) -> bool {
        match self {
            Condition::Always => true,
            Condition::ToolCall => turn.issued_tool_call(),
            Condition::Mentions(phrase) => turn.content.to_lowercase().contains(phrase.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Role(Role),
    /// The worker that spoke before the executor, or `fallback`.
    Invoker { fallback: Role },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub from: Role,
    pub when: Condition,
    pub to: Target,
}

fn rule(from: Role, when: Condition, to: Role) -> Rule {
    Rule {
        from,
        when,
        to: Target::Role(to),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("{0} is not a role of this pipeline")]
    UnknownSpeaker(Role),
    #[error("conversation has no turns to route from")]
    EmptyConversation,
}

#[derive(Debug, Clone)]
pub struct Router {
    pipeline: Pipeline,
    rules: Vec<Rule>,
}

impl Router {
    pub fn new(pipeline: Pipeline, phrases: &RoutingPhrases) -> Self {
        use Condition::{Always, ToolCall};
        use Role::*;

        let mut rules = vec![rule(Initializer, Always, TeamLead)];
        if pipeline == Pipeline::Delegating {
            rules.push(rule(TeamLead, Condition::mentions(&phrases.helper), Helper));
        }
        rules.push(rule(TeamLead, Condition::mentions(&phrases.pentest), Pentest));
        rules.push(rule(TeamLead, Always, TeamLead));

        rules.push(rule(Pentest, ToolCall, Executor));
        match pipeline {
            Pipeline::Supervised => rules.push(rule(Pentest, Always, TaskSupervisor)),
            Pipeline::Delegating => {
                rules.push(rule(Pentest, Condition::mentions(&phrases.supervisor), TaskSupervisor));
                rules.push(rule(Pentest, Always, Pentest));
                rules.push(rule(Helper, ToolCall, Executor));
                rules.push(rule(Helper, Always, TeamLead));
            }
        }

        rules.push(Rule {
            from: Executor,
            when: Always,
            to: Target::Invoker { fallback: Pentest },
        });

        rules.push(rule(TaskSupervisor, Condition::mentions(&phrases.rework), Pentest));
        rules.push(rule(TaskSupervisor, Condition::mentions(&phrases.approve), TeamLead));
        rules.push(rule(TaskSupervisor, Always, TaskSupervisor));

        Self { pipeline, rules }
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn next_speaker(
        &self,
        last_speaker: Role,
        conversation: &Conversation,
    ) -> Result<Role, DispatchError> {
        if !self.pipeline.contains(last_speaker) {
            return Err(DispatchError::UnknownSpeaker(last_speaker));
        }
        let last = conversation.last().ok_or(DispatchError::EmptyConversation)?;

        let target = self
            .rules
            .iter()
            .filter(|r| r.from == last_speaker)
            .find(|r| r.when.holds(last))
            .map(|r| r.to)
            .ok_or(DispatchError::UnknownSpeaker(last_speaker))?;

        Ok(match target {
            Target::Role(role) => role,
            Target::Invoker { fallback } => conversation
                .speaker_before_last(1)
                .filter(|role| role.is_worker() && self.pipeline.contains(*role))
                .unwrap_or(fallback),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Conversation, DispatchError, Pipeline, Role, Router, RoutingPhrases, Turn};
    use crate::models::ScanRequest;

    fn conversation(turns: Vec<Turn>) -> Conversation {
        let mut c = Conversation::default();
        for t in turns {
            c.push(t);
        }
        c
    }

    fn route(pipeline: Pipeline, turns: Vec<Turn>) -> Result<Role, DispatchError> {
        let router = Router::new(pipeline, &RoutingPhrases::default());
        let conv = conversation(turns);
        let speaker = conv.last().map(|t| t.speaker).unwrap_or(Role::Initializer);
        router.next_speaker(speaker, &conv)
    }

    fn scan_call() -> ScanRequest {
        ScanRequest::new("auxiliary", "scanner/portscan/tcp", "192.168.56.101")
    }

    #[test]
    fn initializer_always_hands_to_lead() {
        for pipeline in [Pipeline::Supervised, Pipeline::Delegating] {
            let next = route(pipeline, vec![Turn::new(Role::Initializer, "Please investigate 192.168.56.101")]);
            assert_eq!(next, Ok(Role::TeamLead));
        }
    }

    #[test]
    fn lead_keeps_the_floor_without_worker_keyword() {
        for pipeline in [Pipeline::Supervised, Pipeline::Delegating] {
            let next = route(pipeline, vec![Turn::new(Role::TeamLead, "Let me think about the plan.")]);
            assert_eq!(next, Ok(Role::TeamLead));
        }
    }

    #[test]
    fn lead_addresses_workers_by_keyword() {
        let next = route(
            Pipeline::Supervised,
            vec![Turn::new(Role::TeamLead, "PENTEST agent: run a TCP portscan")],
        );
        assert_eq!(next, Ok(Role::Pentest));

        let next = route(
            Pipeline::Delegating,
            vec![Turn::new(Role::TeamLead, "Helper agent, save the plan; Pentest waits")],
        );
        assert_eq!(next, Ok(Role::Helper));

        // no helper in the five-role shape
        let next = route(
            Pipeline::Supervised,
            vec![Turn::new(Role::TeamLead, "Helper agent, save the plan")],
        );
        assert_eq!(next, Ok(Role::TeamLead));
    }

    #[test]
    fn tool_call_goes_to_executor_regardless_of_text() {
        for pipeline in [Pipeline::Supervised, Pipeline::Delegating] {
            let turn = Turn::new(Role::Pentest, "Task Supervisor, Pentest Agent, rework required")
                .with_tool_request(scan_call());
            assert_eq!(route(pipeline, vec![turn]), Ok(Role::Executor));
        }
        let helper_call = Turn::new(Role::Helper, "writing file").with_tool_request(scan_call());
        assert_eq!(route(Pipeline::Delegating, vec![helper_call]), Ok(Role::Executor));
    }

    #[test]
    fn executor_returns_to_its_invoker() {
        let turns = vec![
            Turn::new(Role::Helper, "").with_tool_request(scan_call()),
            Turn::new(Role::Executor, "file written"),
        ];
        assert_eq!(route(Pipeline::Delegating, turns), Ok(Role::Helper));

        let turns = vec![
            Turn::new(Role::Pentest, "").with_tool_request(scan_call()),
            Turn::new(Role::Executor, "[+] 192.168.56.101:22 - TCP OPEN"),
        ];
        assert_eq!(route(Pipeline::Supervised, turns), Ok(Role::Pentest));

        // only one turn: nothing to look back at
        let turns = vec![Turn::new(Role::Executor, "orphan result")];
        assert_eq!(route(Pipeline::Supervised, turns), Ok(Role::Pentest));
    }

    #[test]
    fn pentest_without_tool_call_depends_on_shape() {
        let done = || vec![Turn::new(Role::Pentest, "Scan finished, ports 22 and 80 open.")];
        assert_eq!(route(Pipeline::Supervised, done()), Ok(Role::TaskSupervisor));
        assert_eq!(route(Pipeline::Delegating, done()), Ok(Role::Pentest));

        let addressed = vec![Turn::new(Role::Pentest, "Task Supervisor, please review.")];
        assert_eq!(route(Pipeline::Delegating, addressed), Ok(Role::TaskSupervisor));
    }

    #[test]
    fn reviewer_routes_on_verdict_phrases() {
        let verdict = |text: &str| route(Pipeline::Supervised, vec![Turn::new(Role::TaskSupervisor, text)]);
        assert_eq!(verdict("Pentest Agent, rework required: missing UDP."), Ok(Role::Pentest));
        assert_eq!(
            verdict("team lead, task completed satisfactorily"),
            Ok(Role::TeamLead)
        );
        assert_eq!(verdict("Still reviewing the output."), Ok(Role::TaskSupervisor));
    }

    #[test]
    fn unknown_speaker_and_empty_conversation_are_errors() {
        let router = Router::new(Pipeline::Supervised, &RoutingPhrases::default());
        let conv = conversation(vec![Turn::new(Role::Helper, "hi")]);
        assert_eq!(
            router.next_speaker(Role::Helper, &conv),
            Err(DispatchError::UnknownSpeaker(Role::Helper))
        );
        assert_eq!(
            router.next_speaker(Role::TeamLead, &Conversation::default()),
            Err(DispatchError::EmptyConversation)
        );
    }

    #[test]
    fn every_role_of_a_shape_has_a_fallback_rule() {
        for pipeline in [Pipeline::Supervised, Pipeline::Delegating] {
            let router = Router::new(pipeline, &RoutingPhrases::default());
            for role in pipeline.roles() {
                assert!(
                    router
                        .rules()
                        .iter()
                        .any(|r| r.from == *role && r.when == super::Condition::Always),
                    "{role} has no unconditional rule in {pipeline:?}"
                );
            }
        }
    }

    #[test]
    fn role_keys_round_trip() {
        assert_eq!(Role::from_key("task_supervisor"), Some(Role::TaskSupervisor));
        assert_eq!(Role::from_key("team_lead"), Some(Role::TeamLead));
        assert_eq!(Role::from_key("boss"), None);
        assert!(Role::Executor.is_bootstrap());
    }
}
