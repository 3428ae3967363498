//! In-memory index of a directory of DICOM files,
//! serving as the match source of each C-FIND request.
use std::collections::VecDeque;
use std::path::Path;

use dicom_core::{Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, OpenFileOptions};
use dicom_qr::{MatchError, MatchSource};
use snafu::Report;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// The attribute sets of every DICOM file found.
#[derive(Debug, Default)]
pub struct Index {
    entries: Vec<InMemDicomObject>,
}

impl Index {
    /// Index all readable DICOM files under `dir`, recursively.
    ///
    /// Files which cannot be read as DICOM are skipped.
    pub fn scan(dir: &Path) -> Self {
        let mut entries = Vec::new();
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("{}", Report::from_error(e));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match OpenFileOptions::new()
                .read_until(tags::PIXEL_DATA)
                .open_file(entry.path())
            {
                Ok(obj) => {
                    debug!("Indexed {}", entry.path().display());
                    entries.push(obj.into_inner());
                }
                Err(e) => warn!(
                    "Skipping {}: {}",
                    entry.path().display(),
                    Report::from_error(e)
                ),
            }
        }
        info!("Indexed {} files from {}", entries.len(), dir.display());
        Index { entries }
    }

    #[cfg(test)]
    pub fn from_objects(entries: Vec<InMemDicomObject>) -> Self {
        Index { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collect the entries matching every key.
    ///
    /// Each match also carries the requested Query/Retrieve Level.
    pub fn search(&self, keys: &InMemDicomObject) -> Matches {
        let level = keys.element(tags::QUERY_RETRIEVE_LEVEL).ok().cloned();
        let items: VecDeque<_> = self
            .entries
            .iter()
            .filter(|candidate| matches(candidate, keys))
            .map(|candidate| {
                let mut candidate = candidate.clone();
                if let Some(level) = &level {
                    candidate.put(level.clone());
                }
                candidate
            })
            .collect();
        debug!("{} of {} entries match", items.len(), self.entries.len());
        Matches { items }
    }
}

/// The matches of one request, handed out one at a time.
#[derive(Debug, Default)]
pub struct Matches {
    items: VecDeque<InMemDicomObject>,
}

impl MatchSource for Matches {
    fn has_more(&mut self) -> Result<bool, MatchError> {
        Ok(!self.items.is_empty())
    }

    fn next_match(&mut self) -> Result<InMemDicomObject, MatchError> {
        self.items
            .pop_front()
            .ok_or_else(|| MatchError::unable_to_process("no more matches"))
    }

    fn close(&mut self) {
        self.items.clear();
    }
}

/// Whether a candidate satisfies every key.
///
/// Query/Retrieve Level, Specific Character Set
/// and keys without a value match anything.
pub fn matches(candidate: &InMemDicomObject, keys: &InMemDicomObject) -> bool {
    keys.iter().all(|key| {
        let tag = key.header().tag;
        if tag == tags::QUERY_RETRIEVE_LEVEL || tag == tags::SPECIFIC_CHARACTER_SET {
            return true;
        }
        let Ok(pattern) = key.to_str() else {
            return true;
        };
        let pattern = pattern.trim_end_matches(['\0', ' ']);
        if pattern.is_empty() {
            return true;
        }
        let Some(value) = candidate_value(candidate, tag) else {
            return false;
        };
        pattern
            .split('\\')
            .any(|alternative| value_matches(key.header().vr, alternative, &value))
    })
}

fn candidate_value(candidate: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = candidate.element(tag).ok()?.to_str().ok()?;
    Some(value.trim_end_matches(['\0', ' ']).to_string())
}

fn value_matches(vr: VR, pattern: &str, value: &str) -> bool {
    match vr {
        VR::DA | VR::TM | VR::DT if pattern.contains('-') => {
            let (low, high) = pattern.split_once('-').unwrap_or((pattern, ""));
            (low.is_empty() || value >= low) && (high.is_empty() || value <= high)
        }
        _ if pattern.contains(['*', '?']) => wildcard_match(pattern, value),
        _ => value
            .split('\\')
            .any(|v| v.trim_end_matches(['\0', ' ']) == pattern),
    }
}

/// Match `value` against a pattern
/// where `*` stands for any sequence and `?` for any single character.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    let (mut p, mut v) = (0, 0);
    // position of the last `*` and the value position it was tried at
    let mut backtrack: Option<(usize, usize)> = None;
    while v < value.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, v));
                p += 1;
            }
            Some(&c) if c == '?' || c == value[v] => {
                p += 1;
                v += 1;
            }
            _ => match backtrack {
                Some((star, tried)) => {
                    p = star + 1;
                    v = tried + 1;
                    backtrack = Some((star, tried + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
