//! MQTT topics used between the kernel and the node agents

pub const REGISTRATION: &str = "fleetota/agents/registration@v1";
pub const HEARTBEAT: &str = "fleetota/agents/heartbeat@v1";
pub const REPLY: &str = "fleetota/agents/reply@v1";

/// Per-node command topic the agent subscribes to
pub fn command_topic(node_id: &str) -> String {
    format!("fleetota/agents/{node_id}/command@v1")
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_command_topic() {
        assert_eq!(super::command_topic("node-7"), "fleetota/agents/node-7/command@v1");
    }
}
