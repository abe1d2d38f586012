use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{debug, warn};

use crate::config::ReservedKeys;
use crate::sample::{Sample, Status};

/// Classification of every identifier found in a prior run's output.
///
/// `completed` samples are skipped entirely on resume; `resumable` samples had
/// a usable response but no terminal completion and are re-attempted;
/// `no_response` identifiers were seen but never got a usable answer.
#[derive(Debug, Default)]
pub struct CompletionLedger {
    pub completed: HashMap<String, Sample>,
    pub resumable: HashMap<String, Sample>,
    pub no_response: Vec<String>,
}

/// A record with no status key is treated as terminally completed: plain
/// single-round runs never set a status at all.
fn status_in(status: Option<Status>, allowed: &[Status]) -> bool {
    match status {
        None => true,
        Some(status) => allowed.contains(&status),
    }
}

pub fn skippable(status: Option<Status>) -> bool {
    status_in(status, &[Status::Completed])
}

pub fn resumable(status: Option<Status>) -> bool {
    status_in(
        status,
        &[
            Status::Processing,
            Status::Error,
            Status::MaxRounds,
            Status::Resume,
        ],
    )
}

/// Statuses eligible for the final output log.
pub fn writable(status: Option<Status>) -> bool {
    status_in(status, &[Status::Completed, Status::Error, Status::MaxRounds])
}

impl CompletionLedger {
    /// Reads a prior output file and classifies each record by id.
    ///
    /// A missing file is simply an empty ledger. A corrupt line stops the
    /// scan but keeps everything classified so far, so a truncated temp log
    /// left behind by a killed process still resumes cleanly.
    pub fn scan(path: &Path, keys: &ReservedKeys) -> Self {
        let mut ledger = CompletionLedger::default();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(_) => {
                debug!(path = %path.display(), "no prior output found, starting fresh");
                return ledger;
            }
        };
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else {
                warn!(path = %path.display(), "unreadable line in prior output, stopping scan");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            let sample: Sample = match serde_json::from_str(&line) {
                Ok(sample) => sample,
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        %error,
                        "corrupt line in prior output, stopping scan"
                    );
                    break;
                }
            };
            let Ok(id) = sample.id(keys) else {
                warn!(path = %path.display(), "record without id in prior output, skipping");
                continue;
            };
            // Multi-round runs append one record per round, so the same id
            // can occur several times. The last record wins.
            ledger.completed.remove(&id);
            ledger.resumable.remove(&id);
            ledger.no_response.retain(|seen| seen != &id);
            let status = sample.status(keys);
            if sample.has_usable_response(keys) && skippable(status) {
                ledger.completed.insert(id, sample);
            } else if sample.has_usable_response(keys) && resumable(status) {
                ledger.resumable.insert(id, sample);
            } else {
                ledger.no_response.push(id);
            }
        }
        debug!(
            path = %path.display(),
            completed = ledger.completed.len(),
            resumable = ledger.resumable.len(),
            no_response = ledger.no_response.len(),
            "classified prior output"
        );
        ledger
    }

    /// Merges this ledger with a lower-precedence one (e.g. the orphaned temp
    /// log): entries already present here win.
    pub fn merged_over(mut self, lower: CompletionLedger) -> Self {
        for (id, sample) in lower.completed {
            self.completed.entry(id).or_insert(sample);
        }
        for (id, sample) in lower.resumable {
            self.resumable.entry(id).or_insert(sample);
        }
        self
    }
}
