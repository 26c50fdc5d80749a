/// One increment of a streamed chat response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    TextDelta { text: String },

    /// Stream completed successfully.
    Done {
        model: String,
        tokens_in: u32,
        tokens_out: u32,
        stop_reason: String,
    },

    /// Error during streaming.
    Error { message: String },
}

/// Parse a single SSE line from Anthropic's streaming API.
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_line() {
        assert_eq!(
            parse_sse_line("data: {\"type\":\"ping\"}"),
            Some(SseParsed::Data("{\"type\":\"ping\"}".to_string()))
        );
    }

    #[test]
    fn parses_event_line() {
        assert_eq!(
            parse_sse_line("event: message_stop"),
            Some(SseParsed::Event("message_stop".to_string()))
        );
    }

    #[test]
    fn non_sse_line_is_none() {
        assert_eq!(parse_sse_line(""), None);
        assert_eq!(parse_sse_line("{\"stray\":true}"), None);
    }
}
