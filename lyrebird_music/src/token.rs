// Token codec: the string form of a single musical event.
//
// A note token is a pitch name with octave ("C4", "F#3", "E-5"; `-` and `b`
// both mean flat). A chord token is a `.`-joined list of pitch classes in
// normal order ("0.4.7"). The presence of a `.` is the only discriminator;
// the vocabulary and the predictor treat tokens as opaque strings and only
// the MIDI bridge (`midi.rs`) looks inside them.
//
// Pitch numbering follows MIDI: C4 = 60, so `pitch = (octave + 1) * 12 + pc`.

use crate::error::{MusicError, MusicResult};

/// Pitch-class spellings used when turning MIDI pitches back into names.
const PITCH_NAMES: [&str; 12] = [
    "C", "C#", "D", "E-", "E", "F", "F#", "G", "G#", "A", "B-", "B",
];

/// Octave assumed when a note name carries none.
const DEFAULT_OCTAVE: i32 = 4;

/// MIDI pitch that chord pitch classes are placed above for playback.
pub const CHORD_BASE_PITCH: u8 = 60;

/// A decoded token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    /// Single pitch with its original spelling.
    Note { name: String, pitch: u8 },
    /// Simultaneous pitch classes, in token order.
    Chord { pitch_classes: Vec<u8> },
}

impl TokenEvent {
    pub fn is_chord(&self) -> bool {
        matches!(self, TokenEvent::Chord { .. })
    }

    /// Concrete MIDI pitches to sound for this event. Chord pitch classes
    /// are voiced in the octave starting at middle C.
    pub fn midi_pitches(&self) -> Vec<u8> {
        match self {
            TokenEvent::Note { pitch, .. } => vec![*pitch],
            TokenEvent::Chord { pitch_classes } => pitch_classes
                .iter()
                .map(|pc| CHORD_BASE_PITCH + pc)
                .collect(),
        }
    }
}

/// Returns true if the token encodes a chord.
pub fn is_chord_token(token: &str) -> bool {
    token.contains('.')
}

/// Parse a token into a note or chord.
pub fn decode_token(token: &str) -> MusicResult<TokenEvent> {
    if is_chord_token(token) {
        let pitch_classes = token
            .split('.')
            .map(|part| match part.trim().parse::<u8>() {
                Ok(pc) if pc < 12 => Ok(pc),
                _ => Err(MusicError::InvalidToken(token.to_string())),
            })
            .collect::<MusicResult<Vec<u8>>>()?;
        Ok(TokenEvent::Chord { pitch_classes })
    } else {
        let pitch = parse_note_name(token)?;
        Ok(TokenEvent::Note {
            name: token.to_string(),
            pitch,
        })
    }
}

/// Parse a pitch name such as "C4", "F#3", "B-2" or "Eb5" into a MIDI pitch.
pub fn parse_note_name(name: &str) -> MusicResult<u8> {
    let invalid = || MusicError::InvalidToken(name.to_string());
    let mut chars = name.chars().peekable();

    let letter = chars.next().ok_or_else(invalid)?;
    let mut pc: i32 = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return Err(invalid()),
    };

    while let Some(&c) = chars.peek() {
        match c {
            '#' => pc += 1,
            '-' | 'b' => pc -= 1,
            _ => break,
        }
        chars.next();
    }

    let rest: String = chars.collect();
    let octave = if rest.is_empty() {
        DEFAULT_OCTAVE
    } else {
        rest.parse::<i32>().map_err(|_| invalid())?
    };

    octave
        .checked_add(1)
        .and_then(|o| o.checked_mul(12))
        .and_then(|base| base.checked_add(pc))
        .and_then(|pitch| u8::try_from(pitch).ok())
        .filter(|p| *p <= 127)
        .ok_or_else(invalid)
}

/// Lowest pitch whose name reads back unchanged. Below it the octave is -1
/// and "C-1" parses as C-flat in octave 1.
pub const LOWEST_NAMED_PITCH: u8 = 12;

/// Name a MIDI pitch, e.g. 60 -> "C4", 63 -> "E-4".
///
/// Names below `LOWEST_NAMED_PITCH` do not survive `parse_note_name`.
pub fn note_token(pitch: u8) -> String {
    let octave = pitch as i32 / 12 - 1;
    format!("{}{}", PITCH_NAMES[(pitch % 12) as usize], octave)
}

/// Build a chord token from sounding pitches.
///
/// Pitch classes are deduplicated and arranged in normal order: the rotation
/// with the smallest span, ties broken by the smallest interval from the
/// first pitch class to each following one, then by the lowest first pitch
/// class. Returns `None` when fewer than two distinct pitch classes remain,
/// since such a token would lack the `.` that marks a chord.
pub fn chord_token(pitches: &[u8]) -> Option<String> {
    let mut pcs: Vec<u8> = pitches.iter().map(|p| p % 12).collect();
    pcs.sort_unstable();
    pcs.dedup();
    if pcs.len() < 2 {
        return None;
    }

    let n = pcs.len();
    let interval = |from: u8, to: u8| (to + 12 - from) % 12;
    let best = (0..n)
        .map(|r| {
            let rotation: Vec<u8> = pcs[r..].iter().chain(&pcs[..r]).copied().collect();
            let first = rotation[0];
            let mut key = vec![interval(first, rotation[n - 1])];
            key.extend(rotation[1..n - 1].iter().map(|&pc| interval(first, pc)));
            key.push(first);
            (key, rotation)
        })
        .min_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, rotation)| rotation)?;

    Some(
        best.iter()
            .map(|pc| pc.to_string())
            .collect::<Vec<_>>()
            .join("."),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chord_token_decodes_to_pitch_classes() {
        let event = decode_token("0.4.7").unwrap();
        assert_eq!(
            event,
            TokenEvent::Chord {
                pitch_classes: vec![0, 4, 7]
            }
        );
        assert!(event.is_chord());
        assert_eq!(event.midi_pitches(), vec![60, 64, 67]);
    }

    #[test]
    fn note_token_decodes_to_single_pitch() {
        assert!(!is_chord_token("C4"));
        let event = decode_token("C4").unwrap();
        assert_eq!(event.midi_pitches(), vec![60]);
        assert!(!event.is_chord());
    }

    #[test]
    fn accidentals_and_octaves() {
        assert_eq!(parse_note_name("A4").unwrap(), 69);
        assert_eq!(parse_note_name("F#4").unwrap(), 66);
        assert_eq!(parse_note_name("E-4").unwrap(), 63);
        assert_eq!(parse_note_name("Eb4").unwrap(), 63);
        assert_eq!(parse_note_name("B3").unwrap(), 59);
        assert_eq!(parse_note_name("C").unwrap(), 60);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for bad in ["", "H4", "C#x", "0.4.12", "1..2", "C99"] {
            assert!(
                matches!(decode_token(bad), Err(MusicError::InvalidToken(_))),
                "{bad:?} should be invalid"
            );
        }
    }

    #[test]
    fn note_names_roundtrip_through_pitch() {
        // Octave -1 would print as "C-1", which reads as C-flat in octave 1.
        for pitch in 12..=127u8 {
            assert_eq!(parse_note_name(&note_token(pitch)).unwrap(), pitch);
        }
        assert_eq!(note_token(60), "C4");
        assert_eq!(note_token(70), "B-4");
    }

    #[test]
    fn chord_normal_order() {
        assert_eq!(chord_token(&[60, 64, 67]).as_deref(), Some("0.4.7"));
        // G major triad in any voicing packs as 7.11.2.
        assert_eq!(chord_token(&[55, 59, 62]).as_deref(), Some("7.11.2"));
        assert_eq!(chord_token(&[62, 67, 71]).as_deref(), Some("7.11.2"));
        // Octave doublings collapse.
        assert_eq!(chord_token(&[48, 60, 64]).as_deref(), Some("0.4"));
        assert_eq!(chord_token(&[48, 60]), None);
    }
}
