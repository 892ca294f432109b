use std::fmt;

/// One line of a traceback: where execution was in some live call
/// frame when the error struck. A `function` of `None` is the
/// top-level script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: u32,
    pub function: Option<String>,
}

/// A runtime error: the message plus a stack trace, innermost
/// frame first. The VM builds one of these, resets its stack so a
/// REPL session can carry on, and unwinds out of the dispatch
/// loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub message: String,
    pub frames: Vec<TraceFrame>,
}

impl Trace {
    pub fn new(message: impl Into<String>) -> Trace {
        Trace {
            message: message.into(),
            frames: Vec::new(),
        }
    }

    /// Appends one frame while unwinding; call innermost first.
    pub fn push_frame(&mut self, line: u32, function: Option<String>) {
        self.frames.push(TraceFrame { line, function });
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuntimeError: {}", self.message)?;
        for frame in &self.frames {
            write!(f, "\n[line {}] in ", frame.line)?;
            match &frame.function {
                Some(name) => write!(f, "{}()", name)?,
                None => write!(f, "script")?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for Trace {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn formats_message_and_frames() {
        let mut trace = Trace::new("Undefined variable 'zzz'.");
        trace.push_frame(3, Some("inner".to_string()));
        trace.push_frame(7, None);

        assert_eq!(
            trace.to_string(),
            "RuntimeError: Undefined variable 'zzz'.\n[line 3] in inner()\n[line 7] in script"
        );
    }
}
