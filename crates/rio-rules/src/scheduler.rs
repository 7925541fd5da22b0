//! Second-aligned scheduler driving the rule engine.
//!
//! Holds the named-execution table and the schedule lines from
//! `crontab.json`. The tick task aligns itself to the next whole second,
//! then processes all three rule sets once per second, handing fired
//! executions to the dispatcher channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rio_core::command::Execution;

use crate::cron::parse_schedule;
use crate::engine::RuleEngine;

/// `crontab.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Crontab {
    #[serde(default)]
    pub schedules: Vec<String>,
    #[serde(default)]
    pub commands: HashMap<String, Execution>,
}

pub struct Scheduler {
    engine: Arc<RuleEngine>,
    crontab_path: PathBuf,
    commands: Mutex<HashMap<String, Execution>>,
    schedules: Mutex<Vec<String>>,
    dispatch: mpsc::UnboundedSender<Execution>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<RuleEngine>,
        crontab_path: impl AsRef<Path>,
        dispatch: mpsc::UnboundedSender<Execution>,
    ) -> Self {
        Self {
            engine,
            crontab_path: crontab_path.as_ref().to_path_buf(),
            commands: Mutex::new(HashMap::new()),
            schedules: Mutex::new(Vec::new()),
            dispatch,
            tick_task: Mutex::new(None),
        }
    }

    /// Load `crontab.json` and rebuild the periodic rule set. A missing
    /// file clears the schedules.
    pub fn reload(&self) {
        let crontab = if self.crontab_path.exists() {
            match std::fs::read_to_string(&self.crontab_path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str::<Crontab>(&text).map_err(|e| e.to_string()))
            {
                Ok(crontab) => crontab,
                Err(err) => {
                    warn!(path = %self.crontab_path.display(), error = %err, "crontab unreadable");
                    Crontab::default()
                }
            }
        } else {
            Crontab::default()
        };
        self.apply(crontab);
    }

    /// Install a crontab document directly (tests, ruleset replacement).
    pub fn apply(&self, crontab: Crontab) {
        let mut rules = Vec::new();
        for line in &crontab.schedules {
            match parse_schedule(line, &crontab.commands) {
                Ok(rule) => rules.push(rule),
                // A broken schedule fails alone; the rest keep running.
                Err(err) => warn!(schedule = %line, error = %err, "schedule skipped"),
            }
        }
        info!(
            schedules = crontab.schedules.len(),
            rules = rules.len(),
            commands = crontab.commands.len(),
            "schedules rebuilt"
        );
        self.engine.set_periodic(rules);
        *self.schedules.lock() = crontab.schedules;
        *self.commands.lock() = crontab.commands;
    }

    /// Named execution lookup, for `schedule <command>` requests.
    pub fn command(&self, name: &str) -> Option<Execution> {
        self.commands.lock().get(name).cloned()
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn schedules(&self) -> Vec<String> {
        self.schedules.lock().clone()
    }

    /// Rule expressions currently live in the engine.
    pub fn describe(&self) -> Vec<String> {
        self.engine.describe()
    }

    /// Dispatch one execution through the scheduler's channel.
    pub fn dispatch(&self, execution: Execution) {
        if self.dispatch.send(execution).is_err() {
            warn!("dispatcher gone, execution dropped");
        }
    }

    /// Start the tick task. Aligns to the next whole second first so
    /// second-precision schedules observe every wall-clock second once.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.tick_task.lock();
        if slot.is_some() {
            return;
        }
        let scheduler = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let now = chrono::Utc::now();
            let subsec = now.timestamp_subsec_millis() as u64 % 1000;
            tokio::time::sleep(Duration::from_millis(1000 - subsec)).await;

            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let fired = scheduler.engine.process();
                if !fired.is_empty() {
                    debug!(count = fired.len(), "rules fired");
                }
                for execution in fired {
                    scheduler.dispatch(execution);
                }
            }
        }));
    }

    /// Stop the tick task. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.tick_task.lock().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.tick_task.lock().is_some()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rio_core::knowledge::Knowledge;

    fn crontab(schedules: &[&str]) -> Crontab {
        Crontab {
            schedules: schedules.iter().map(|s| s.to_string()).collect(),
            commands: HashMap::from([("doBeep".to_string(), Execution::new("sim", "beep"))]),
        }
    }

    #[test]
    fn apply_builds_rules_and_skips_broken_lines() {
        let engine = Arc::new(RuleEngine::new(Knowledge::new()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(engine.clone(), "/nonexistent/crontab.json", tx);

        scheduler.apply(crontab(&[
            "0 * * * * * * * doBeep",
            "* * * Noday * * * * doBeep",
            "bogus",
        ]));
        assert_eq!(engine.counts().0, 1);
        assert_eq!(scheduler.schedules().len(), 3);
        assert!(scheduler.command("doBeep").is_some());
        assert!(scheduler.command("other").is_none());
    }

    #[tokio::test]
    async fn tick_fires_matching_schedule_once() {
        let knowledge = Knowledge::new();
        let engine = Arc::new(RuleEngine::new(knowledge));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler::new(
            engine.clone(),
            "/nonexistent/crontab.json",
            tx,
        ));
        // Matches every tick; minute precision keeps the re-trigger
        // window at a full minute so only one fire is observed.
        scheduler.apply(crontab(&["* 0-59 * * * * * * doBeep"]));
        scheduler.start();

        let first = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("schedule fired")
            .unwrap();
        assert_eq!(first.label(), "sim.beep");

        // Within the trigger window nothing else fires.
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(second.is_err());
        scheduler.stop();
        assert!(!scheduler.is_running());
    }
}
