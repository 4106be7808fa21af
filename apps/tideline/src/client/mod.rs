//! Turns the ordered message stream into scene snapshots.

use scene_tree::{AppRoot, Element, Generation, TreeError};
use tracing::{debug, warn};

use crate::protocol::{ForwardMsg, ForwardMsgBody, PageInfo, ScriptFinishedStatus, SessionStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum SceneUpdate {
    SessionStarted { session_id: String },
    StatusChanged(SessionStatus),
    TreeChanged,
    /// A run completed and stale nodes were pruned. The caller should
    /// advance the message cache with this age.
    RunFinished { max_cached_message_age: u64 },
    RunStopped(ScriptFinishedStatus),
    PageChanged(PageInfo),
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneSummary {
    pub main_children: usize,
    pub sidebar_children: usize,
    pub elements: usize,
    pub errors: usize,
}

pub struct SceneState {
    root: AppRoot,
    generation: Generation,
    session_id: Option<String>,
    status: SessionStatus,
    max_cached_message_age: u64,
}

impl Default for SceneState {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SceneState {
    pub fn new(placeholder: Option<Element>) -> Self {
        Self {
            root: AppRoot::empty(placeholder),
            generation: Generation::none(),
            session_id: None,
            status: SessionStatus::default(),
            max_cached_message_age: 2,
        }
    }

    pub fn root(&self) -> &AppRoot {
        &self.root
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Applies one logical message. A delta addressed to a missing element
    /// is returned as an error and leaves the scene unchanged.
    pub fn handle_message(&mut self, msg: &ForwardMsg) -> Result<SceneUpdate, TreeError> {
        match &msg.body {
            ForwardMsgBody::NewSession(session) => {
                self.generation = Generation::new(&session.script_run_id);
                self.session_id = Some(session.session_id.clone());
                self.max_cached_message_age = session.config.max_cached_message_age;
                debug!(
                    target = "tideline::client",
                    run = %self.generation,
                    session_id = %session.session_id,
                    "script run started"
                );
                Ok(SceneUpdate::SessionStarted {
                    session_id: session.session_id.clone(),
                })
            }
            ForwardMsgBody::SessionStatusChanged(status) => {
                self.status = *status;
                Ok(SceneUpdate::StatusChanged(*status))
            }
            ForwardMsgBody::Delta(delta) => {
                self.root =
                    self.root
                        .apply_delta(&self.generation, delta, &msg.metadata.delta_path)?;
                Ok(SceneUpdate::TreeChanged)
            }
            ForwardMsgBody::ScriptFinished(ScriptFinishedStatus::FinishedSuccessfully) => {
                self.root = self.root.clear_stale_nodes(&self.generation);
                Ok(SceneUpdate::RunFinished {
                    max_cached_message_age: self.max_cached_message_age,
                })
            }
            ForwardMsgBody::ScriptFinished(status) => Ok(SceneUpdate::RunStopped(*status)),
            ForwardMsgBody::PageInfoChanged(info) => Ok(SceneUpdate::PageChanged(info.clone())),
            ForwardMsgBody::RefHash(hash) => {
                warn!(target = "tideline::client", hash = %hash, "unresolved reference message");
                Ok(SceneUpdate::Ignored)
            }
        }
    }

    pub fn summary(&self) -> SceneSummary {
        let elements = self.root.elements();
        SceneSummary {
            main_children: self.root.main().children().len(),
            sidebar_children: self.root.sidebar().children().len(),
            errors: elements.iter().filter(|element| element.is_error()).count(),
            elements: elements.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ForwardMsgMetadata, NewSession, SessionSettings};
    use scene_tree::{Delta, MAIN, NamedDataSet, RowTable, SIDEBAR};
    use serde_json::json;

    fn new_session(run: &str) -> ForwardMsg {
        ForwardMsg::new(
            "ns",
            ForwardMsgBody::NewSession(NewSession {
                script_run_id: run.into(),
                session_id: "s-1".into(),
                config: SessionSettings {
                    max_cached_message_age: 5,
                },
            }),
        )
    }

    fn delta(path: Vec<usize>, delta: Delta) -> ForwardMsg {
        ForwardMsg::new("d", ForwardMsgBody::Delta(delta)).with_metadata(ForwardMsgMetadata {
            cacheable: false,
            delta_path: path,
        })
    }

    fn text(body: &str) -> Delta {
        Delta::NewElement(Element::Text { body: body.into() })
    }

    fn finished() -> ForwardMsg {
        ForwardMsg::new(
            "f",
            ForwardMsgBody::ScriptFinished(ScriptFinishedStatus::FinishedSuccessfully),
        )
    }

    #[test]
    fn a_run_builds_then_prunes_the_scene() {
        let mut scene = SceneState::default();
        scene.handle_message(&new_session("run-1")).unwrap();
        scene.handle_message(&delta(vec![MAIN, 0], text("a"))).unwrap();
        scene.handle_message(&delta(vec![MAIN, 1], text("b"))).unwrap();
        scene.handle_message(&delta(vec![SIDEBAR, 0], text("c"))).unwrap();
        assert_eq!(scene.summary().elements, 3);

        scene.handle_message(&new_session("run-2")).unwrap();
        scene.handle_message(&delta(vec![MAIN, 0], text("a2"))).unwrap();
        let update = scene.handle_message(&finished()).unwrap();
        assert_eq!(
            update,
            SceneUpdate::RunFinished {
                max_cached_message_age: 5
            }
        );
        assert_eq!(
            scene.summary(),
            SceneSummary {
                main_children: 1,
                sidebar_children: 0,
                elements: 1,
                errors: 0,
            }
        );
        assert_eq!(scene.generation().as_str(), "run-2");
    }

    #[test]
    fn interrupted_runs_keep_stale_nodes() {
        let mut scene = SceneState::default();
        scene.handle_message(&new_session("run-1")).unwrap();
        scene.handle_message(&delta(vec![MAIN, 0], text("a"))).unwrap();
        scene.handle_message(&new_session("run-2")).unwrap();
        let update = scene
            .handle_message(&ForwardMsg::new(
                "f",
                ForwardMsgBody::ScriptFinished(ScriptFinishedStatus::FinishedEarlyForRerun),
            ))
            .unwrap();
        assert_eq!(
            update,
            SceneUpdate::RunStopped(ScriptFinishedStatus::FinishedEarlyForRerun)
        );
        assert_eq!(scene.summary().elements, 1);
    }

    #[test]
    fn add_rows_to_missing_element_leaves_scene_unchanged() {
        let mut scene = SceneState::default();
        scene.handle_message(&new_session("run-1")).unwrap();
        let before = scene.root().root().clone();
        let batch = NamedDataSet {
            name: None,
            data: RowTable {
                columns: vec!["x".into()],
                rows: vec![vec![json!(1)]],
            },
        };
        let err = scene
            .handle_message(&delta(vec![MAIN, 3], Delta::AddRows(batch)))
            .unwrap_err();
        assert!(matches!(err, TreeError::NoElementAtPath(_)));
        assert!(std::sync::Arc::ptr_eq(&before, scene.root().root()));
    }

    #[test]
    fn add_rows_to_text_becomes_an_error_element() {
        let mut scene = SceneState::default();
        scene.handle_message(&new_session("run-1")).unwrap();
        scene.handle_message(&delta(vec![MAIN, 0], text("a"))).unwrap();
        let batch = NamedDataSet {
            name: None,
            data: RowTable {
                columns: vec!["x".into()],
                rows: vec![vec![json!(1)]],
            },
        };
        scene
            .handle_message(&delta(vec![MAIN, 0], Delta::AddRows(batch)))
            .unwrap();
        assert_eq!(scene.summary().errors, 1);
    }
}
