use std::collections::HashMap;

/// One parsed request header block: repeated `key: value` lines up to a
/// blank line.
#[derive(Debug, Default)]
pub struct AgiRequest {
    headers: HashMap<String, String>,
}

impl AgiRequest {
    pub fn parse(lines: &[String]) -> Self {
        let mut headers = HashMap::new();
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self { headers }
    }

    pub fn header(&self, key: &str) -> &str {
        self.headers.get(key).map(String::as_str).unwrap_or("")
    }

    /// The script path the dialplan invoked, e.g.
    /// `agi://router:4573/processIncoming`.
    pub fn request(&self) -> &str {
        self.header("agi_request")
    }

    pub fn call_id(&self) -> &str {
        self.header("agi_uniqueid")
    }

    pub fn ani(&self) -> &str {
        self.header("agi_callerid")
    }

    pub fn dnis(&self) -> &str {
        self.header("agi_extension")
    }

    pub fn channel(&self) -> &str {
        self.header("agi_channel")
    }
}

/// Status line the switch sends back after each command.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandStatus {
    /// `200 result=1`, optionally with a trailing `(value)`.
    Success(Option<String>),
    /// `200 result=0`.
    Failure,
    /// `510 ...` or anything unrecognized.
    Unknown,
}

impl CommandStatus {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("200 result=1") {
            let value = rest
                .trim()
                .strip_prefix('(')
                .and_then(|v| v.strip_suffix(')'))
                .map(str::to_string);
            return Self::Success(value);
        }
        if line.starts_with("200 result=0") {
            return Self::Failure;
        }
        Self::Unknown
    }
}

/// Quotes a value for `SET VARIABLE`. Embedded quotes would break the
/// switch's parser, so they are dropped.
pub fn set_variable(name: &str, value: &str) -> String {
    let value = value.replace('"', "");
    format!("SET VARIABLE {name} \"{value}\"\n")
}

pub fn get_variable(name: &str) -> String {
    format!("GET VARIABLE {name}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_block() {
        let lines = vec![
            "agi_request: agi://10.0.0.9:4573/processIncoming".to_string(),
            "agi_uniqueid: 1722470400.42".to_string(),
            "agi_callerid: +15551000".to_string(),
            "agi_extension: +15552000".to_string(),
            "agi_channel: PJSIP/endpoint-orig1-00000042".to_string(),
        ];
        let request = AgiRequest::parse(&lines);

        assert!(request.request().contains("processIncoming"));
        assert_eq!(request.call_id(), "1722470400.42");
        assert_eq!(request.ani(), "+15551000");
        assert_eq!(request.dnis(), "+15552000");
        assert_eq!(request.channel(), "PJSIP/endpoint-orig1-00000042");
        assert_eq!(request.header("agi_missing"), "");
    }

    #[test]
    fn parses_status_lines() {
        assert_eq!(CommandStatus::parse("200 result=1"), CommandStatus::Success(None));
        assert_eq!(
            CommandStatus::parse("200 result=1 (10.0.0.2:5060)"),
            CommandStatus::Success(Some("10.0.0.2:5060".to_string()))
        );
        assert_eq!(CommandStatus::parse("200 result=0"), CommandStatus::Failure);
        assert_eq!(
            CommandStatus::parse("510 Invalid or unknown command"),
            CommandStatus::Unknown
        );
    }

    #[test]
    fn set_variable_strips_quotes() {
        assert_eq!(
            set_variable("ROUTER_ERROR", "bad \"input\""),
            "SET VARIABLE ROUTER_ERROR \"bad input\"\n"
        );
    }
}
