use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use wire_types::{is_echobox, Mac, UnitKind};

use crate::ScheduleError;

/// Minimum time between load attempts, so a missing file does not get
/// polled every loop iteration.
const LOAD_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub mac: u32,
    pub has_data_ready: bool,
}

/// Ordered, reloadable set of base-station-driven target MACs. One hex MAC
/// per line, `#` comments; only EchoBox-class nodes are admitted.
#[derive(Debug, Default)]
pub struct NodeList {
    path: Option<PathBuf>,
    nodes: Vec<NodeEntry>,
    cursor: usize,
    last_load_attempt: Option<Instant>,
}

impl NodeList {
    pub fn new(path: impl AsRef<Path>) -> Self {
        log::info!(
            target: "nodelist",
            "Node list file set to: {}",
            path.as_ref().display()
        );
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.cursor
    }

    /// Load (or reload) the file, resetting the cursor. Non-EchoBox lines
    /// are skipped with a warning naming the actual class.
    pub fn load(&mut self) -> Result<bool, ScheduleError> {
        let path = self.path.as_ref().ok_or(ScheduleError::NoNodeListFile)?;
        self.last_load_attempt = Some(Instant::now());

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return Ok(false),
        };

        self.nodes.clear();
        let mut skipped = 0usize;
        for line in text.lines() {
            let cleaned: String = line.chars().filter(|c| !c.is_whitespace()).collect();
            if cleaned.is_empty() || cleaned.starts_with('#') {
                continue;
            }
            let Ok(mac) = cleaned.parse::<Mac>() else {
                continue;
            };
            if is_echobox(mac.0) {
                self.nodes.push(NodeEntry {
                    mac: mac.0,
                    has_data_ready: false,
                });
                log::info!(target: "nodelist", "Added EchoBox node: {}", mac);
            } else {
                skipped += 1;
                log::warn!(
                    target: "nodelist",
                    "Skipped non-EchoBox node {} (type: {})",
                    mac,
                    UnitKind::from_mac(mac.0)
                );
            }
        }

        self.cursor = 0;
        log::info!(
            target: "nodelist",
            "Loaded {} EchoBox nodes from {}",
            self.nodes.len(),
            path.display()
        );
        if skipped > 0 {
            log::warn!(target: "nodelist", "Skipped {} non-EchoBox nodes", skipped);
        }
        Ok(!self.nodes.is_empty())
    }

    /// True when enough time has passed since the last load attempt.
    pub fn should_attempt_load(&self) -> bool {
        self.last_load_attempt
            .map(|t| t.elapsed() >= LOAD_RETRY_INTERVAL)
            .unwrap_or(true)
    }

    pub fn current_mac(&self) -> Option<u32> {
        self.nodes.get(self.cursor).map(|n| n.mac)
    }

    pub fn advance(&mut self) {
        if !self.nodes.is_empty() {
            self.cursor += 1;
            if self.cursor >= self.nodes.len() {
                log::info!(target: "nodelist", "Reached end of node list");
            }
        }
    }

    pub fn is_at_end(&self) -> bool {
        self.nodes.is_empty() || self.cursor >= self.nodes.len()
    }

    /// Reload when the cursor has walked off the end; resets to the first
    /// node on success.
    pub fn check_and_reload_if_at_end(&mut self) -> Result<bool, ScheduleError> {
        if self.is_at_end() {
            return self.load();
        }
        Ok(true)
    }

    pub fn contains(&self, mac: u32) -> bool {
        self.nodes.iter().any(|n| n.mac == mac)
    }

    pub fn mark_data_ready(&mut self, mac: u32) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.mac == mac) {
            node.has_data_ready = true;
        }
    }
}
