use heapless::Vec;

pub const LINE_CAPACITY: usize = 64;

pub type Line = Vec<u8, LINE_CAPACITY>;

/// What one input byte did to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// Nothing to report: a mid-line byte, a bare terminator, or a byte
    /// swallowed while discarding an oversized line.
    Pending,
    /// First byte of a new line.
    Started,
    /// A complete line, terminator stripped.
    Line(Line),
    /// The buffer filled up. The partial line is gone and input is skipped
    /// up to the next terminator.
    Overflow,
}

/// Fixed-capacity line buffer for the host link.
///
/// A line ends at `\n` or `\r`, or at `>` when it opened with `<`. An
/// oversized line is reported once and never executed.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Line,
    /// Set while skipping an oversized line; holds whether it opened with `<`.
    discarding: Option<bool>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.discarding.is_none()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.discarding = None;
    }

    pub fn push(&mut self, b: u8) -> Feed {
        let newline = b == b'\n' || b == b'\r';

        if let Some(marked) = self.discarding {
            if newline || (marked && b == b'>') {
                self.discarding = None;
            }
            return Feed::Pending;
        }

        if newline {
            if self.buf.is_empty() {
                return Feed::Pending;
            }
            return Feed::Line(core::mem::take(&mut self.buf));
        }

        let started = self.buf.is_empty();
        if self.buf.push(b).is_err() {
            let marked = self.buf.first() == Some(&b'<');
            self.buf.clear();
            if !(marked && b == b'>') {
                self.discarding = Some(marked);
            }
            return Feed::Overflow;
        }
        if b == b'>' && self.buf.first() == Some(&b'<') {
            return Feed::Line(core::mem::take(&mut self.buf));
        }
        if started {
            Feed::Started
        } else {
            Feed::Pending
        }
    }
}
