/// An SMTP reply: a three-digit code plus human-readable text.
///
/// A text containing embedded `\n` renders as an RFC 5321 multi-line reply:
/// every fragment but the last uses the `NNN-` continuation form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self { code, text: text.into() }
    }

    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    /// Render with CRLF line termination, ready for the wire.
    pub fn format(&self) -> String {
        let mut out = String::new();
        let mut fragments = self.text.split('\n').peekable();
        while let Some(fragment) = fragments.next() {
            let sep = if fragments.peek().is_some() { '-' } else { ' ' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, fragment));
        }
        out
    }
}
