use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::{
    controller::ScanController,
    dispatch::{Conversation, Role, Router, Turn},
    models::ScanRequest,
};

pub const DEFAULT_TERMINATION_MARKER: &str = "TERMINATE";
pub const DEFAULT_MAX_ROUNDS: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub content: String,
    pub tool_request: Option<ScanRequest>,
}

impl Reply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_request: None,
        }
    }

    pub fn tool_call(content: impl Into<String>, request: ScanRequest) -> Self {
        Self {
            content: content.into(),
            tool_request: Some(request),
        }
    }
}

#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    async fn respond(&self, conversation: &Conversation) -> anyhow::Result<Reply>;
}

#[derive(Clone, Default)]
pub struct RoleTable {
    agents: HashMap<Role, Arc<dyn Agent>>,
}

impl RoleTable {
    pub fn bind(mut self, role: Role, agent: Arc<dyn Agent>) -> Self {
        self.agents.insert(role, agent);
        self
    }

    pub fn get(&self, role: Role) -> Option<&Arc<dyn Agent>> {
        self.agents.get(&role)
    }
}

/// Runs the scan in the previous turn's tool request.
pub struct ScanToolAgent {
    controller: ScanController,
}

impl ScanToolAgent {
    pub fn new(controller: ScanController) -> Self {
        Self { controller }
    }
}

#[async_trait::async_trait]
impl Agent for ScanToolAgent {
    async fn respond(&self, conversation: &Conversation) -> anyhow::Result<Reply> {
        let Some(request) = conversation.last().and_then(|t| t.tool_request.as_ref()) else {
            return Ok(Reply::text("No tool call to execute."));
        };
        // Failures go back to the invoking role, which decides whether to retry.
        match self.controller.execute(request).await {
            Ok(output) => Ok(Reply::text(output)),
            Err(e) => {
                warn!(module = %request.module_path(), error = %e, "tool call failed");
                Ok(Reply::text(format!("Scan failed: {e}")))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Terminated,
    RoundLimit,
}

#[derive(Debug)]
pub struct WorkflowReport {
    pub conversation: Conversation,
    pub stop: StopReason,
}

pub struct Workflow {
    router: Router,
    roles: RoleTable,
    max_rounds: usize,
    termination_marker: String,
}

impl Workflow {
    pub fn new(router: Router, roles: RoleTable) -> anyhow::Result<Self> {
        let unbound: Vec<Role> = router
            .pipeline()
            .roles()
            .iter()
            .copied()
            .filter(|role| *role != Role::Initializer && roles.get(*role).is_none())
            .collect();
        if !unbound.is_empty() {
            anyhow::bail!("no agent bound for roles: {unbound:?}");
        }
        Ok(Self {
            router,
            roles,
            max_rounds: DEFAULT_MAX_ROUNDS,
            termination_marker: DEFAULT_TERMINATION_MARKER.to_string(),
        })
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_termination_marker(mut self, marker: impl Into<String>) -> Self {
        self.termination_marker = marker.into();
        self
    }

    /// The initializer's `main_input` is the first turn; the conversation is
    /// handed back with the report.
    pub async fn run(&self, main_input: &str) -> anyhow::Result<WorkflowReport> {
        let mut conversation = Conversation::default();
        conversation.push(Turn::new(Role::Initializer, main_input));

        loop {
            let Some(last) = conversation.last() else {
                anyhow::bail!("conversation lost its opening turn");
            };
            if last.content.contains(&self.termination_marker) {
                info!(turns = conversation.len(), speaker = %last.speaker, "workflow terminated");
                return Ok(WorkflowReport {
                    conversation,
                    stop: StopReason::Terminated,
                });
            }
            if conversation.len() >= self.max_rounds {
                warn!(max_rounds = self.max_rounds, "workflow hit the round limit");
                return Ok(WorkflowReport {
                    conversation,
                    stop: StopReason::RoundLimit,
                });
            }

            let last_speaker = last.speaker;
            let next = self.router.next_speaker(last_speaker, &conversation)?;
            let agent = self
                .roles
                .get(next)
                .with_context(|| format!("no agent bound for {next}"))?;
            debug!(from = %last_speaker, to = %next, "dispatching turn");

            let reply = agent
                .respond(&conversation)
                .await
                .with_context(|| format!("{next} failed to respond"))?;
            let mut turn = Turn::new(next, reply.content);
            turn.tool_request = reply.tool_request;
            conversation.push(turn);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::{Agent, Reply, RoleTable, ScanToolAgent, StopReason, Workflow};
    use crate::{
        cache::tests::temp_cache,
        compression::Compressor,
        console::testing::ScriptedFactory,
        controller::{ScanController, ScanSettings, BANNER_DELIMITER},
        dispatch::{Conversation, Pipeline, Role, Router, RoutingPhrases},
        models::ScanRequest,
    };

    /// Replays canned replies, repeating the last one when it runs out.
    struct Scripted {
        replies: Mutex<VecDeque<Reply>>,
    }

    impl Scripted {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Agent for Scripted {
        async fn respond(&self, _conversation: &Conversation) -> anyhow::Result<Reply> {
            let mut replies = self.replies.lock().unwrap();
            let reply = if replies.len() > 1 {
                replies.pop_front()
            } else {
                replies.front().cloned()
            };
            Ok(reply.unwrap_or_default())
        }
    }

    fn scan() -> ScanRequest {
        ScanRequest::new("auxiliary", "scanner/portscan/tcp", "192.168.56.101")
    }

    #[tokio::test]
    async fn supervised_run_scans_reviews_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = format!(
            "{BANNER_DELIMITER}[+] 192.168.56.101:22 - TCP OPEN\n[*] Auxiliary module execution completed\n"
        );
        let factory = ScriptedFactory::new(&[&transcript]);
        let settings = ScanSettings {
            poll_interval: Duration::from_millis(5),
            ..ScanSettings::default()
        };
        let controller =
            ScanController::new(factory.clone(), temp_cache(&dir), Compressor::default(), settings);

        let roles = RoleTable::default()
            .bind(
                Role::TeamLead,
                Scripted::new(vec![
                    Reply::text("Pentest agent, scan the host."),
                    Reply::text("All done. TERMINATE"),
                ]),
            )
            .bind(
                Role::Pentest,
                Scripted::new(vec![
                    Reply::tool_call("", scan()),
                    Reply::text("Port 22 is open."),
                ]),
            )
            .bind(
                Role::TaskSupervisor,
                Scripted::new(vec![Reply::text("Team Lead, task completed satisfactorily")]),
            )
            .bind(Role::Executor, Arc::new(ScanToolAgent::new(controller)));

        let router = Router::new(Pipeline::Supervised, &RoutingPhrases::default());
        let report = Workflow::new(router, roles)
            .unwrap()
            .run("Please investigate 192.168.56.101")
            .await
            .unwrap();

        let speakers: Vec<Role> = report.conversation.turns().iter().map(|t| t.speaker).collect();
        assert_eq!(
            speakers,
            vec![
                Role::Initializer,
                Role::TeamLead,
                Role::Pentest,
                Role::Executor,
                Role::Pentest,
                Role::TaskSupervisor,
                Role::TeamLead,
            ]
        );
        assert_eq!(report.stop, StopReason::Terminated);
        assert!(report.conversation.turns()[3].content.contains("192.168.56.101:22"));
        assert_eq!(factory.opened(), 1);
    }

    #[tokio::test]
    async fn chatty_lead_stops_at_round_limit() {
        let roles = RoleTable::default()
            .bind(Role::TeamLead, Scripted::new(vec![Reply::text("thinking")]))
            .bind(Role::Pentest, Scripted::new(vec![]))
            .bind(Role::TaskSupervisor, Scripted::new(vec![]))
            .bind(Role::Executor, Scripted::new(vec![]));
        let router = Router::new(Pipeline::Supervised, &RoutingPhrases::default());
        let report = Workflow::new(router, roles)
            .unwrap()
            .with_max_rounds(5)
            .run("start")
            .await
            .unwrap();

        assert_eq!(report.stop, StopReason::RoundLimit);
        assert_eq!(report.conversation.len(), 5);
    }

    #[test]
    fn missing_agents_are_reported_up_front() {
        let roles = RoleTable::default().bind(Role::TeamLead, Scripted::new(vec![]));
        let router = Router::new(Pipeline::Delegating, &RoutingPhrases::default());
        let err = Workflow::new(router, roles).err().expect("workflow should not build");
        assert!(err.to_string().contains("Helper"));
    }

    #[tokio::test]
    async fn executor_without_tool_call_says_so() {
        let dir = tempfile::tempdir().unwrap();
        let controller = ScanController::new(
            ScriptedFactory::new(&[]),
            temp_cache(&dir),
            Compressor::default(),
            ScanSettings::default(),
        );
        let agent = ScanToolAgent::new(controller);
        let reply = agent.respond(&Conversation::default()).await.unwrap();
        assert_eq!(reply.content, "No tool call to execute.");
    }
}
