use std::fmt::Write;
use std::io;

use anyhow::Result;
use loffice::{Report, Stats};

pub fn print(report: &Report, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", render(report));
    }
    Ok(())
}

/// Rewrites the running counter line in place. Goes to stdout; stderr
/// belongs to the log.
pub fn progress(out: &mut impl io::Write, stats: &Stats) -> io::Result<()> {
    write!(out, "{stats}\r")?;
    out.flush()
}

/// Human-readable summary, one section per kind of result.
pub fn render(report: &Report) -> String {
    let results = &report.results;
    let mut out = String::new();

    section(&mut out, "FILE HANDLES OPENED");
    for (path, modes) in &results.file_handles {
        let tags: Vec<_> = modes.iter().map(|m| m.tag()).collect();
        let _ = writeln!(out, "{} \t {path}", tags.join(","));
    }

    section(&mut out, "STRING COMPARISONS");
    for (subject, needles) in &results.string_comparisons {
        let needles: Vec<_> = needles.iter().map(String::as_str).collect();
        let _ = writeln!(out, "\nSubject: {subject}");
        let _ = writeln!(out, "Search for: {}", needles.join(", "));
    }

    section(&mut out, "WMI QUERIES");
    for wmi in &results.wmi_queries {
        let _ = writeln!(out, "Query: {}", wmi.query);
        if let Some(patched) = &wmi.patched {
            let _ = writeln!(out, " Patched with: {patched}");
        }
        out.push('\n');
    }

    section(&mut out, "URL");
    for url in &results.urls {
        let _ = writeln!(out, "{url}");
    }

    section(&mut out, "PROCESS CREATION");
    for proc in &results.process_creations {
        let _ = writeln!(out, "Cmd: {}\nApp: {}", proc.cmdline, proc.app);
    }

    let _ = writeln!(out, "\n{}\nOutcome: {}", report.stats, report.outcome);
    out
}

fn section(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n\n\t==== {title} ====\n");
}
