//! The deterministic chat state machine (spec §4.2, §3).
//!
//! Applies committed commands in order, keeps at most `RETENTION_LIMIT`
//! of them visible, and persists durably. Grounded on the original
//! `ChatState` (`original_source/server/state_machine.py`) for the basic
//! shape (in-memory list + append-only JSONL file) and on the teacher's
//! `distributed::wal::WriteAheadLog` for the rewrite-mode atomic
//! temp-file-then-rename discipline used whenever a trim occurs.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::command::Command;

/// Trailing window of committed commands kept visible (spec §3, §8).
pub const RETENTION_LIMIT: usize = 100;

/// The replicated chat log's state machine.
///
/// `apply` is idempotent per index and must be invoked exactly once per
/// committed index, strictly in order — the consensus core is responsible
/// for that ordering guarantee; this type trusts its caller.
pub struct ChatStateMachine {
    path: PathBuf,
    commands: Vec<Command>,
}

impl ChatStateMachine {
    /// Open (or create) the state machine backed by the durable file at
    /// `path`. Malformed lines are skipped with a warning (spec §7); a
    /// completely unreadable file is treated as empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut commands = Self::load(&path);

        if commands.len() > RETENTION_LIMIT {
            let excess = commands.len() - RETENTION_LIMIT;
            commands.drain(0..excess);
            Self::rewrite(&path, &commands)
                .context("rewriting durable file after startup trim")?;
        }

        Ok(Self { path, commands })
    }

    fn load(path: &Path) -> Vec<Command> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let reader = BufReader::new(file);
        let mut commands = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!(line = lineno, error = %e, "failed reading durable log line");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Command>(&line) {
                Ok(cmd) => commands.push(cmd),
                Err(e) => warn!(line = lineno, error = %e, "skipping malformed durable log line"),
            }
        }
        commands
    }

    /// Apply a committed command: append to the visible list, persist it,
    /// and trim to `RETENTION_LIMIT` if necessary.
    pub fn apply(&mut self, command: Command) -> Result<()> {
        self.commands.push(command);

        if self.commands.len() > RETENTION_LIMIT {
            let excess = self.commands.len() - RETENTION_LIMIT;
            self.commands.drain(0..excess);
            // An apply that trims MUST use rewrite mode (spec §4.2): the
            // file is replaced wholesale via temp + atomic rename so a
            // crash mid-write leaves either the old or the new file intact,
            // never a half-written one.
            Self::rewrite(&self.path, &self.commands)?;
        } else {
            self.append_line(self.commands.last().expect("just pushed"))?;
        }

        Ok(())
    }

    fn append_line(&self, command: &Command) -> Result<()> {
        let line = serde_json::to_string(command)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening durable log {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    fn rewrite(path: &Path, commands: &[Command]) -> Result<()> {
        let tmp_path = path.with_extension("jsonl.tmp");
        {
            let mut tmp = File::create(&tmp_path)
                .with_context(|| format!("creating temp file {}", tmp_path.display()))?;
            for command in commands {
                let line = serde_json::to_string(command)?;
                writeln!(tmp, "{line}")?;
            }
            tmp.flush()?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming {} over {}", tmp_path.display(), path.display()))?;
        Ok(())
    }

    /// Read-only snapshot of the currently visible commands, in apply order.
    pub fn all(&self) -> Vec<Command> {
        self.commands.clone()
    }

    /// Number of commands currently visible (`<= RETENTION_LIMIT`).
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn chat(id: &str) -> Command {
        Command::Chat {
            user: "a".into(),
            text: format!("msg {id}"),
            room: "general".into(),
            id: id.into(),
        }
    }

    #[test]
    fn apply_persists_and_is_visible() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut sm = ChatStateMachine::open(&path).unwrap();

        sm.apply(chat("1")).unwrap();
        sm.apply(chat("2")).unwrap();

        assert_eq!(sm.all(), vec![chat("1"), chat("2")]);
    }

    #[test]
    fn restart_replays_durable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");

        {
            let mut sm = ChatStateMachine::open(&path).unwrap();
            sm.apply(chat("1")).unwrap();
            sm.apply(chat("2")).unwrap();
        }

        let sm = ChatStateMachine::open(&path).unwrap();
        assert_eq!(sm.all(), vec![chat("1"), chat("2")]);
    }

    #[test]
    fn retention_keeps_last_100() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut sm = ChatStateMachine::open(&path).unwrap();

        for i in 0..150 {
            sm.apply(chat(&i.to_string())).unwrap();
        }

        let all = sm.all();
        assert_eq!(all.len(), RETENTION_LIMIT);
        assert_eq!(all[0], chat("50"));
        assert_eq!(all[99], chat("149"));

        // Durable file reflects the same trimmed window after restart.
        drop(sm);
        let sm = ChatStateMachine::open(&path).unwrap();
        assert_eq!(sm.all(), all);
    }

    #[test]
    fn malformed_lines_are_skipped_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        {
            let mut f = File::create(&path).unwrap();
            writeln!(f, "{}", serde_json::to_string(&chat("1")).unwrap()).unwrap();
            writeln!(f, "not json at all").unwrap();
            writeln!(f, "{}", serde_json::to_string(&chat("2")).unwrap()).unwrap();
        }

        let sm = ChatStateMachine::open(&path).unwrap();
        assert_eq!(sm.all(), vec![chat("1"), chat("2")]);
    }

    #[test]
    fn missing_file_is_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("does-not-exist.jsonl");
        let sm = ChatStateMachine::open(&path).unwrap();
        assert!(sm.is_empty());
    }
}
