// Newline-delimited framing for stream transports.
//
// Stream transports may deliver partial lines; the codec buffers until a
// terminator arrives. Frames never contain raw newlines (they are compact
// JSON), so splitting on '\n' is exact.

/// Incremental splitter for newline-delimited frames.
#[derive(Debug, Default)]
pub struct NewlineDelimitedCodec {
    buffer: String,
}

impl NewlineDelimitedCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of input; returns every complete frame it terminates.
    pub fn push_chunk(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches('\n').trim();
            if !line.is_empty() {
                frames.push(line.to_string());
            }
        }
        frames
    }

    /// Any buffered partial line (flushed by the caller at end-of-stream).
    pub fn finish(self) -> Option<String> {
        let tail = self.buffer.trim();
        if tail.is_empty() {
            None
        } else {
            Some(tail.to_string())
        }
    }

    /// Join outbound frames into one newline-delimited body.
    pub fn join(frames: &[String]) -> String {
        frames.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines() {
        let mut codec = NewlineDelimitedCodec::new();
        let frames = codec.push_chunk("[\"pull\",1]\n[\"pull\",2]\n");
        assert_eq!(frames, vec!["[\"pull\",1]", "[\"pull\",2]"]);
    }

    #[test]
    fn buffers_partial_lines_across_chunks() {
        let mut codec = NewlineDelimitedCodec::new();
        assert!(codec.push_chunk("[\"pu").is_empty());
        assert!(codec.push_chunk("ll\",").is_empty());
        let frames = codec.push_chunk("7]\n[\"pull\"");
        assert_eq!(frames, vec!["[\"pull\",7]"]);
        assert_eq!(codec.finish(), Some("[\"pull\"".to_string()));
    }

    #[test]
    fn skips_empty_lines_and_joins() {
        let mut codec = NewlineDelimitedCodec::new();
        let frames = codec.push_chunk("\n\n[\"pull\",1]\n\n");
        assert_eq!(frames, vec!["[\"pull\",1]"]);

        let joined = NewlineDelimitedCodec::join(&[
            "[\"resolve\",1,8]".to_string(),
            "[\"release\",2,1]".to_string(),
        ]);
        assert_eq!(joined, "[\"resolve\",1,8]\n[\"release\",2,1]");
    }
}
