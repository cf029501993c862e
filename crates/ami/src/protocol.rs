//! Wire form of the switch management protocol: `key: value` lines,
//! CRLF-terminated, with a blank line ending each message.

/// One protocol message. Field order is preserved on the wire and keys
/// may repeat (variable lists do), so this is a list, not a map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    fields: Vec<(String, String)>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(name: &str) -> Self {
        let mut message = Self::new();
        message.push("Action", name);
        message
    }

    pub fn push(&mut self, key: &str, value: &str) -> &mut Self {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.push(key, value);
        self
    }

    /// First value for `key`, compared case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn action_id(&self) -> Option<u64> {
        self.get("ActionID")?.parse().ok()
    }

    /// Event name, when this message is a fan-out event.
    pub fn event(&self) -> Option<&str> {
        self.get("Event")
    }

    /// Whether this is a response message (as opposed to an event).
    pub fn is_response(&self) -> bool {
        self.get("Response").is_some()
    }

    pub fn is_success(&self) -> bool {
        self.get("Response")
            .map(|r| r.eq_ignore_ascii_case("success"))
            .unwrap_or(false)
    }

    /// Parses one message from its accumulated lines.
    pub fn parse(lines: &[String]) -> Self {
        let mut message = Self::new();
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                message.push(key.trim(), value.trim());
            }
        }
        message
    }

    /// Serializes for the wire, including the terminating blank line.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let message = Message::action("Login")
            .with("Username", "router")
            .with("Secret", "hunter2");

        let wire = message.serialize();
        assert_eq!(
            wire,
            "Action: Login\r\nUsername: router\r\nSecret: hunter2\r\n\r\n"
        );

        let lines: Vec<String> = wire
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let parsed = Message::parse(&lines);
        assert_eq!(parsed.get("Action"), Some("Login"));
        assert_eq!(parsed.get("username"), Some("router"));
    }

    #[test]
    fn classification() {
        let response = Message::new()
            .with("Response", "Success")
            .with("ActionID", "7")
            .with("Message", "Authentication accepted");
        assert!(response.is_response());
        assert!(response.is_success());
        assert_eq!(response.action_id(), Some(7));
        assert_eq!(response.event(), None);

        let event = Message::new()
            .with("Event", "CoreShowChannel")
            .with("ActionID", "9");
        assert!(!event.is_response());
        assert_eq!(event.event(), Some("CoreShowChannel"));
        assert_eq!(event.action_id(), Some(9));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let parsed = Message::parse(&[
            "Response: Error".to_string(),
            "no colon here".to_string(),
            "Message: Missing action".to_string(),
        ]);
        assert_eq!(parsed.fields().len(), 2);
        assert!(!parsed.is_success());
    }
}
