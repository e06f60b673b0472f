//! Session-wide bookkeeping of everything the interceptions observed.
//! Collections only ever grow; nothing is removed during a session.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::events::Event;

/// How a file was opened, from the `GENERIC_READ` / `GENERIC_WRITE` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum AccessMode {
    #[serde(rename = "R")]
    Read,
    #[serde(rename = "W")]
    Write,
}

impl AccessMode {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Read => "R",
            Self::Write => "W",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessCreation {
    pub app: String,
    pub cmdline: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WmiQuery {
    pub query: String,
    /// Text left in memory after neutralization, if the query was patched.
    pub patched: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultStore {
    /// Searched string -> strings searched for in it.
    pub string_comparisons: BTreeMap<String, BTreeSet<String>>,
    pub file_handles: BTreeMap<String, BTreeSet<AccessMode>>,
    pub urls: Vec<String>,
    pub process_creations: Vec<ProcessCreation>,
    pub wmi_queries: Vec<WmiQuery>,
}

/// Per-event counters. Unlike the collections these are never deduplicated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub url: u64,
    pub file_write: u64,
    pub file_read: u64,
    pub proc: u64,
    pub wmi: u64,
    pub strcmp: u64,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "URL: {}  |  File(W): {}  |  File(R): {}  |  Proc: {}  |  \
                   WMI: {}  |  StrCmp: {}",
               self.url, self.file_write, self.file_read, self.proc, self.wmi,
               self.strcmp)
    }
}

/// Owns the results of one session and merges interpreted events into them.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    pub results: ResultStore,
    pub stats: Stats,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// One event, one counter increment and one append or merge.
    pub fn merge(&mut self, event: &Event) {
        let results = &mut self.results;
        let stats = &mut self.stats;

        match event {
            Event::Url(url) => {
                results.urls.push(url.clone());
                stats.url += 1;
            }
            Event::FileOpen { path, access } => {
                results.file_handles.entry(path.clone())
                    .or_default()
                    .extend(access.iter().copied());
                if access.contains(&AccessMode::Write) {
                    stats.file_write += 1;
                } else {
                    stats.file_read += 1;
                }
            }
            Event::ProcessCreate(proc) => {
                results.process_creations.push(proc.clone());
                stats.proc += 1;
            }
            Event::WmiQuery(query) => {
                results.wmi_queries.push(query.clone());
                stats.wmi += 1;
            }
            Event::WmiMethod { .. } => {
                stats.wmi += 1;
            }
            Event::StringCompare { needle, haystack } => {
                results.string_comparisons.entry(haystack.clone())
                    .or_default()
                    .insert(needle.clone());
                stats.strcmp += 1;
            }
        }
    }
}
