//! Which executable opens the document.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tracing::info;

use crate::app::ProgramType;

const WORD_EXTENSIONS: &[&str] = &["doc", "docx", "docm", "dot", "dotx",
                                   "docb", "dotm"];
const EXCEL_EXTENSIONS: &[&str] = &["xls", "xlsx", "xlsm", "xlt", "xlm",
                                    "xltx", "xltm", "xlsb", "xla", "xlw",
                                    "xlam"];
const POWERPOINT_EXTENSIONS: &[&str] = &["ppt", "pptx", "pptm", "pot", "pps",
                                         "potx", "potm", "ppam", "ppsx",
                                         "sldx", "sldm"];
const SCRIPT_EXTENSIONS: &[&str] = &["js", "jse", "vbs", "vbe", "vb"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    Word,
    Excel,
    PowerPoint,
    ScriptHost,
}

impl Program {
    /// Executable path. Office programs live in `office_dir`, the script
    /// host in the system directory.
    pub fn executable(self, office_dir: &Path) -> PathBuf {
        match self {
            Self::Word => office_dir.join("WINWORD.EXE"),
            Self::Excel => office_dir.join("EXCEL.EXE"),
            Self::PowerPoint => office_dir.join("POWERPNT.EXE"),
            Self::ScriptHost => {
                let windir = std::env::var_os("WINDIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(r"C:\Windows"));
                windir.join("system32").join("wscript.exe")
            }
        }
    }

    /// Guesses the program from the file extension.
    pub fn detect(filename: &Path) -> Option<Self> {
        let ext = filename.extension()?.to_str()?.to_ascii_lowercase();
        [(WORD_EXTENSIONS, Self::Word),
         (EXCEL_EXTENSIONS, Self::Excel),
         (POWERPOINT_EXTENSIONS, Self::PowerPoint),
         (SCRIPT_EXTENSIONS, Self::ScriptHost)]
            .into_iter()
            .find(|(exts, _)| exts.contains(&ext.as_str()))
            .map(|(_, program)| program)
    }
}

/// `%PROGRAMFILES%\Microsoft Office\Office14`
pub fn default_office_dir() -> PathBuf {
    std::env::var_os("PROGRAMFILES")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Program Files"))
        .join("Microsoft Office")
        .join("Office14")
}

pub fn select(kind: ProgramType, filename: &Path, office_dir: &Path)
    -> Result<PathBuf> {
    let program = match kind {
        ProgramType::Word => Program::Word,
        ProgramType::Excel => Program::Excel,
        ProgramType::Power => Program::PowerPoint,
        ProgramType::Script => Program::ScriptHost,
        ProgramType::Auto => {
            let Some(program) = Program::detect(filename) else {
                bail!("failed to detect the type of {}", filename.display());
            };
            info!("Auto-detected program to launch: {program:?}");
            program
        }
    };
    Ok(program.executable(office_dir))
}
