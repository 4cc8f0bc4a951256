use anyhow::{Context, Result};

use crate::{Detection, Detector};

/// Plays back recorded detections, one JSON array per line. Blank lines are
/// empty frames. Once the file runs out every cycle sees nothing, unless
/// looping is enabled.
#[derive(Debug)]
pub struct ReplayDetector {
    frames: Vec<Vec<Detection>>,
    next: usize,
    looped: bool,
}

impl ReplayDetector {
    pub fn open(path: &str, looped: bool) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("open detection replay {}", path))?;
        let frames = parse_frames(&text).with_context(|| format!("parse detection replay {}", path))?;
        tracing::info!("detection replay: {} frames from {}", frames.len(), path);
        Ok(Self { frames, next: 0, looped })
    }

    pub fn from_frames(frames: Vec<Vec<Detection>>, looped: bool) -> Self {
        Self { frames, next: 0, looped }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len().saturating_sub(self.next)
    }
}

fn parse_frames(text: &str) -> Result<Vec<Vec<Detection>>> {
    text.lines()
        .enumerate()
        .map(|(n, line)| {
            let line = line.trim();
            if line.is_empty() {
                return Ok(Vec::new());
            }
            serde_json::from_str(line).with_context(|| format!("line {}", n + 1))
        })
        .collect()
}

impl Detector for ReplayDetector {
    fn detect(&mut self) -> Result<Vec<Detection>> {
        if self.next >= self.frames.len() {
            if !self.looped || self.frames.is_empty() {
                return Ok(Vec::new());
            }
            self.next = 0;
        }
        let frame = self.frames[self.next].clone();
        self.next += 1;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_play_in_order_then_go_quiet() {
        let text = "[{\"bbox\":[300,220,40,40],\"confidence\":0.9}]\n\n[]\n";
        let mut det = ReplayDetector::from_frames(parse_frames(text).unwrap(), false);
        assert_eq!(det.remaining(), 3);
        let first = det.detect().unwrap();
        assert_eq!(first[0].center(), (320.0, 240.0));
        assert_eq!(first[0].class_id, 0);
        assert!(det.detect().unwrap().is_empty());
        assert!(det.detect().unwrap().is_empty());
        assert!(det.detect().unwrap().is_empty());
    }

    #[test]
    fn looping_restarts() {
        let text = "[{\"bbox\":[0,0,10,10],\"confidence\":0.5,\"class_id\":3}]\n";
        let mut det = ReplayDetector::from_frames(parse_frames(text).unwrap(), true);
        assert_eq!(det.detect().unwrap().len(), 1);
        assert_eq!(det.detect().unwrap()[0].class_id, 3);
    }

    #[test]
    fn bad_line_is_reported_with_its_number() {
        let err = parse_frames("[]\n{nope\n").unwrap_err();
        assert_eq!(err.to_string(), "line 2");
    }
}
