use serde::Serialize;

use crate::container::test_container_name;

/// Per-test-case bookkeeping shared between the runner, the test case
/// body and teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlackBoxState {
    pub test_case_name: String,
    pub node_names: Vec<String>,
    pub test_result: bool,
}

impl BlackBoxState {
    pub fn new<I, S>(test_case_name: impl Into<String>, node_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            test_case_name: test_case_name.into(),
            node_names: node_names.into_iter().map(Into::into).collect(),
            test_result: false,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.node_names.len()
    }

    pub fn has_node(&self, node: &str) -> bool {
        self.node_names.iter().any(|n| n == node)
    }

    /// Name of the container bound to `node` while this case runs.
    pub fn container_name(&self, node: &str) -> String {
        test_container_name(&self.test_case_name, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_follow_test_case() {
        let state = BlackBoxState::new("invite_join", ["relay", "peer"]);
        assert_eq!(state.num_nodes(), 2);
        assert!(state.has_node("peer"));
        assert!(!state.has_node("nut"));
        assert_eq!(state.container_name("relay"), "invite_join_relay");
        assert!(!state.test_result);
    }
}
