/// Extracts the provider name from a switch channel identifier.
///
/// Channels look like `PJSIP/endpoint-tr1-00000042` or `PJSIP/tr1-00000042`:
/// the technology prefix, then the endpoint name, then a unique suffix.
/// Provider names may themselves contain dashes, so only the last dash
/// separates the suffix. Malformed input yields the empty string.
pub fn provider_from_channel(channel: &str) -> String {
    let Some((_tech, rest)) = channel.split_once('/') else {
        return String::new();
    };
    let tokens: Vec<&str> = rest.split('-').collect();

    if tokens.first() == Some(&"endpoint") && tokens.len() >= 3 {
        tokens[1..tokens.len() - 1].join("-")
    } else if tokens.len() >= 2 {
        tokens[..tokens.len() - 1].join("-")
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::provider_from_channel;

    #[test]
    fn endpoint_prefixed_channels() {
        assert_eq!(provider_from_channel("PJSIP/endpoint-tr1-00000042"), "tr1");
        assert_eq!(
            provider_from_channel("PJSIP/endpoint-tr-east-00000042"),
            "tr-east"
        );
    }

    #[test]
    fn bare_channels() {
        assert_eq!(provider_from_channel("PJSIP/tr1-00000042"), "tr1");
        assert_eq!(provider_from_channel("SIP/carrier-a-1f3b"), "carrier-a");
    }

    #[test]
    fn endpoint_literal_with_too_few_tokens_is_bare() {
        // "endpoint-X" has no unique suffix to strip beyond X itself.
        assert_eq!(provider_from_channel("PJSIP/endpoint-42"), "endpoint");
    }

    #[test]
    fn malformed_inputs_yield_empty() {
        assert_eq!(provider_from_channel(""), "");
        assert_eq!(provider_from_channel("no-slash-here"), "");
        assert_eq!(provider_from_channel("PJSIP/"), "");
        assert_eq!(provider_from_channel("PJSIP/noname"), "");
    }
}
