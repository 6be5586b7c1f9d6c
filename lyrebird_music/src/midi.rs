// MIDI bridge between token sequences and Standard MIDI Files.
//
// Writing: each token becomes one or more simultaneous notes. Token `i`
// starts `i * step` ticks in and lasts a quarter note, so with the default
// half-beat step consecutive notes overlap. Output is SMF Format 1 with a
// tempo track (120 BPM) and one acoustic-piano track.
//
// Reading: note-on events (velocity > 0) from every track are collected by
// absolute tick. One distinct pitch at a tick is a note token; several are a
// chord token of their pitch classes. Pitches that all share one pitch class
// (octave doublings) collapse to a note token of the lowest.
//
// Uses the `midly` crate for both directions.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u24, u28},
};

use crate::corpus::Corpus;
use crate::error::{MusicError, MusicResult};
use crate::token::{LOWEST_NAMED_PITCH, chord_token, decode_token, note_token};

/// Ticks per quarter note in MIDI output.
pub const TICKS_PER_QUARTER: u16 = 480;

/// Onset spacing of generated tokens: half a beat.
pub const TOKEN_STEP_TICKS: u32 = TICKS_PER_QUARTER as u32 / 2;

const TEMPO_BPM: u32 = 120;
const PIANO: u8 = 0;
const VELOCITY: u8 = 80;

/// Demo files written by `write_sample_files`: broken-chord figures played
/// as quarter notes.
pub const SAMPLE_PATTERNS: [(&str, [&str; 6]); 4] = [
    ("sample_cmajor.mid", ["C4", "E4", "G4", "C5", "G4", "E4"]),
    ("sample_dmajor.mid", ["D4", "F#4", "A4", "D5", "A4", "F#4"]),
    ("sample_aminor.mid", ["A3", "C4", "E4", "A4", "E4", "C4"]),
    ("sample_gmajor.mid", ["G3", "B3", "D4", "G4", "D4", "B3"]),
];

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Render `tokens` to a MIDI file, one token every half beat.
pub fn write_tokens_midi(tokens: &[String], path: &Path) -> MusicResult<()> {
    let smf = tokens_to_smf(tokens, TOKEN_STEP_TICKS)?;
    write_smf(&smf, path)
}

/// Build an in-memory SMF with token `i` at tick `i * step_ticks`.
pub fn tokens_to_smf(tokens: &[String], step_ticks: u32) -> MusicResult<Smf<'static>> {
    // (tick, is_note_on, pitch); offs sort before ons at the same tick so a
    // repeated pitch is released before it is struck again.
    let mut events: Vec<(u32, bool, u8)> = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let start = i as u32 * step_ticks;
        let end = start + TICKS_PER_QUARTER as u32;
        for pitch in decode_token(token)?.midi_pitches() {
            events.push((start, true, pitch));
            events.push((end, false, pitch));
        }
    }
    events.sort();

    let channel = u4::new(0);
    let mut track: Track<'static> = vec![
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::TrackName(b"Piano")),
        },
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Midi {
                channel,
                message: MidiMessage::ProgramChange {
                    program: u7::new(PIANO),
                },
            },
        },
    ];

    let mut last_tick = 0;
    for (tick, on, pitch) in events {
        let message = if on {
            MidiMessage::NoteOn {
                key: u7::new(pitch),
                vel: u7::new(VELOCITY),
            }
        } else {
            MidiMessage::NoteOff {
                key: u7::new(pitch),
                vel: u7::new(0),
            }
        };
        track.push(TrackEvent {
            delta: u28::new(tick - last_tick),
            kind: TrackEventKind::Midi { channel, message },
        });
        last_tick = tick;
    }
    track.push(end_of_track());

    let mut smf = Smf::new(Header::new(
        Format::Parallel,
        Timing::Metrical(u15::new(TICKS_PER_QUARTER)),
    ));
    smf.tracks.push(vec![
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(60_000_000 / TEMPO_BPM))),
        },
        end_of_track(),
    ]);
    smf.tracks.push(track);
    Ok(smf)
}

fn end_of_track() -> TrackEvent<'static> {
    TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    }
}

fn write_smf(smf: &Smf<'_>, path: &Path) -> MusicResult<()> {
    let mut buf = Vec::new();
    smf.write_std(&mut buf)
        .map_err(|e| MusicError::Midi(format!("encode {}: {e}", path.display())))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &buf)?;
    Ok(())
}

/// Write the four demo files into `folder`, returning their paths.
pub fn write_sample_files(folder: &Path) -> MusicResult<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(SAMPLE_PATTERNS.len());
    for (name, notes) in SAMPLE_PATTERNS {
        let tokens: Vec<String> = notes.iter().map(|n| n.to_string()).collect();
        let smf = tokens_to_smf(&tokens, TICKS_PER_QUARTER as u32)?;
        let path = folder.join(name);
        write_smf(&smf, &path)?;
        tracing::debug!(path = %path.display(), "wrote sample file");
        written.push(path);
    }
    Ok(written)
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read one MIDI file into tokens, in onset order.
pub fn read_midi_tokens(path: &Path) -> MusicResult<Vec<String>> {
    let bytes = std::fs::read(path)?;
    let smf = Smf::parse(&bytes)
        .map_err(|e| MusicError::Midi(format!("parse {}: {e}", path.display())))?;
    Ok(smf_to_tokens(&smf))
}

/// Group note-ons across all tracks by absolute tick.
pub fn smf_to_tokens(smf: &Smf<'_>) -> Vec<String> {
    let mut onsets: BTreeMap<u64, BTreeSet<u8>> = BTreeMap::new();
    for track in &smf.tracks {
        let mut tick: u64 = 0;
        for event in track {
            tick += u64::from(event.delta.as_int());
            let struck = match event.kind {
                TrackEventKind::Midi {
                    message: MidiMessage::NoteOn { key, vel },
                    ..
                } if vel.as_int() > 0 => Some(key.as_int()),
                _ => None,
            };
            if let Some(pitch) = struck {
                onsets.entry(tick).or_default().insert(pitch);
            }
        }
    }

    onsets
        .into_iter()
        .filter_map(|(tick, pitches)| {
            let pitches: Vec<u8> = pitches.into_iter().collect();
            let named = |pitch: u8| {
                if pitch < LOWEST_NAMED_PITCH {
                    tracing::warn!(tick, pitch, "skipping note below C0");
                    None
                } else {
                    Some(note_token(pitch))
                }
            };
            match pitches.as_slice() {
                [] => None,
                [single] => named(*single),
                [lowest, ..] => chord_token(&pitches).or_else(|| named(*lowest)),
            }
        })
        .collect()
}

/// Build a corpus from every `.mid`/`.midi` file in `folder`, in file-name
/// order. Unreadable files are skipped with a warning. Falls back to the
/// built-in pattern library when nothing usable is found.
pub fn extract_corpus(folder: &Path) -> Corpus {
    let files = match midi_files(folder) {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!(folder = %folder.display(), error = %e, "cannot list MIDI folder");
            Vec::new()
        }
    };

    let mut corpus = Corpus::default();
    for path in &files {
        match read_midi_tokens(path) {
            Ok(tokens) => {
                tracing::info!(path = %path.display(), tokens = tokens.len(), "parsed MIDI file");
                corpus.extend(tokens);
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping MIDI file"),
        }
    }

    if corpus.is_empty() {
        tracing::info!(folder = %folder.display(), "no MIDI data found, using fallback patterns");
        return Corpus::fallback();
    }
    corpus
}

fn midi_files(folder: &Path) -> MusicResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(folder)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| {
                        e.eq_ignore_ascii_case("mid") || e.eq_ignore_ascii_case("midi")
                    })
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn smf_layout() {
        let smf = tokens_to_smf(&tokens(&["C4", "0.4.7"]), TOKEN_STEP_TICKS).unwrap();
        assert_eq!(smf.tracks.len(), 2);
        assert_eq!(smf.header.format, Format::Parallel);

        let note_ons = smf.tracks[1]
            .iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    TrackEventKind::Midi {
                        message: MidiMessage::NoteOn { .. },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(note_ons, 4);
    }

    #[test]
    fn tokens_survive_an_smf_round_trip() {
        let original = tokens(&["C4", "E-4", "0.4.7", "F#3", "2.5.9", "C4"]);
        let smf = tokens_to_smf(&original, TOKEN_STEP_TICKS).unwrap();
        let mut buf = Vec::new();
        smf.write_std(&mut buf).unwrap();
        let parsed = Smf::parse(&buf).unwrap();
        assert_eq!(smf_to_tokens(&parsed), original);
    }

    #[test]
    fn octave_doubling_reads_as_lowest_note() {
        let smf = tokens_to_smf(&tokens(&["C4"]), TOKEN_STEP_TICKS).unwrap();
        let mut doubled = smf.clone();
        doubled.tracks[1].insert(
            3,
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Midi {
                    channel: u4::new(0),
                    message: MidiMessage::NoteOn {
                        key: u7::new(72),
                        vel: u7::new(80),
                    },
                },
            },
        );
        assert_eq!(smf_to_tokens(&doubled), vec!["C4"]);
    }

    fn strike(delta: u32, key: u8) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(0),
                message: MidiMessage::NoteOn {
                    key: u7::new(key),
                    vel: u7::new(80),
                },
            },
        }
    }

    #[test]
    fn notes_below_c0_are_skipped() {
        let mut smf = Smf::new(Header::new(
            Format::SingleTrack,
            Timing::Metrical(u15::new(TICKS_PER_QUARTER)),
        ));
        smf.tracks.push(vec![
            strike(0, 0),
            strike(240, 11),
            strike(240, 60),
            // Octave doubling below C0 collapses to its lowest note.
            strike(240, 0),
            strike(0, 12),
            // Chords keep only pitch classes, so a low root is fine.
            strike(240, 5),
            strike(0, 64),
            strike(0, 67),
            end_of_track(),
        ]);
        let chord = chord_token(&[5, 64, 67]).unwrap();
        assert_eq!(smf_to_tokens(&smf), vec!["C4".to_string(), chord]);
    }

    #[test]
    fn invalid_token_is_rejected() {
        assert!(matches!(
            tokens_to_smf(&tokens(&["H9"]), TOKEN_STEP_TICKS),
            Err(MusicError::InvalidToken(_))
        ));
    }
}
