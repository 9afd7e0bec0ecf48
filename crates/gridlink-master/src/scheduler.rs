//! # Task Scheduler
//!
//! A slab-backed group of master tasks ordered by priority with explicit
//! dependencies. The executor loop asks for the next runnable task, runs its
//! handler (outside this module), and reports success or failure back; the
//! group computes retry times and dependency eligibility.
//!
//! A task is runnable when it is enabled, its `next_run` has arrived, and
//! every dependency has completed successfully since its last reset.

use bitflags::bitflags;
use quanta::Instant;
use slab::Slab;
use std::time::Duration;

/// Key of a task within its group.
pub type TaskId = usize;

bitflags! {
    /// Task scheduling behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u8 {
        /// Enabled on link-up, disabled (state preserved) on link-down.
        const ONLINE_ONLY = 0x01;
        /// Re-scheduled immediately on every link-up.
        const START_UP = 0x02;
    }
}

// Lower number = higher priority.
pub const PRIORITY_COMMAND: i32 = 0;
pub const PRIORITY_CLEAR_RESTART: i32 = 1;
pub const PRIORITY_TIME_SYNC: i32 = 2;
pub const PRIORITY_UNSOL_CHANGE: i32 = 3;
pub const PRIORITY_POLL: i32 = 4;

/// Definition of a task added to a group.
#[derive(Debug, Clone)]
pub struct TaskDef {
    pub name: &'static str,
    pub priority: i32,
    /// `None` makes the task continuous: it runs only when demanded.
    pub period: Option<Duration>,
    pub retry_period: Duration,
    pub flags: TaskFlags,
}

#[derive(Debug)]
struct Task {
    def: TaskDef,
    dependencies: Vec<TaskId>,
    enabled: bool,
    /// Completed successfully since the last startup reset.
    completed: bool,
    next_run: Option<Instant>,
}

/// A group of tasks sharing one executor.
#[derive(Debug, Default)]
pub struct TaskGroup {
    tasks: Slab<Task>,
}

impl TaskGroup {
    pub fn new() -> Self {
        TaskGroup { tasks: Slab::new() }
    }

    pub fn add(&mut self, def: TaskDef) -> TaskId {
        let enabled = !def.flags.contains(TaskFlags::ONLINE_ONLY);
        self.tasks.insert(Task {
            def,
            dependencies: Vec::new(),
            enabled,
            completed: false,
            next_run: None,
        })
    }

    /// Require `dependency` to complete before `task` becomes runnable.
    pub fn add_dependency(&mut self, task: TaskId, dependency: TaskId) {
        debug_assert!(task != dependency);
        self.tasks[task].dependencies.push(dependency);
    }

    pub fn name(&self, id: TaskId) -> &'static str {
        self.tasks[id].def.name
    }

    pub fn is_completed(&self, id: TaskId) -> bool {
        self.tasks[id].completed
    }

    pub fn is_enabled(&self, id: TaskId) -> bool {
        self.tasks[id].enabled
    }

    /// Trigger a continuous task (command submitted, NEED_TIME seen, restart
    /// IIN observed).
    pub fn demand(&mut self, id: TaskId, now: Instant) {
        self.tasks[id].next_run = Some(now);
    }

    /// Link-up: enable online tasks, rewind startup tasks, and schedule
    /// periodic polls.
    pub fn on_link_up(&mut self, now: Instant) {
        for (_, task) in self.tasks.iter_mut() {
            if task.def.flags.contains(TaskFlags::ONLINE_ONLY) {
                task.enabled = true;
            }
            if task.def.flags.contains(TaskFlags::START_UP) {
                task.completed = false;
                task.next_run = Some(now);
            } else if task.def.period.is_some() && task.next_run.is_none() {
                task.next_run = Some(now);
            }
        }
    }

    /// Link-down: disable online tasks without losing their state.
    pub fn on_link_down(&mut self) {
        for (_, task) in self.tasks.iter_mut() {
            if task.def.flags.contains(TaskFlags::ONLINE_ONLY) {
                task.enabled = false;
            }
        }
    }

    fn is_runnable(&self, task: &Task, now: Instant) -> bool {
        task.enabled
            && task.next_run.is_some_and(|at| at <= now)
            && task
                .dependencies
                .iter()
                .all(|&dep| self.tasks[dep].completed)
    }

    /// The next task the executor should run: among runnable tasks, the
    /// highest priority, ties broken by the earliest `next_run`.
    pub fn next_runnable(&self, now: Instant) -> Option<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, task)| self.is_runnable(task, now))
            .min_by_key(|(_, task)| (task.def.priority, task.next_run))
            .map(|(id, _)| id)
    }

    /// The task's handler completed successfully.
    pub fn on_success(&mut self, id: TaskId, now: Instant) {
        let task = &mut self.tasks[id];
        task.completed = true;
        task.next_run = task.def.period.map(|p| now + p);
        tracing::debug!(task = task.def.name, "task completed");
    }

    /// The task's handler failed; retry after the task's retry period
    /// without marking dependents eligible.
    pub fn on_failure(&mut self, id: TaskId, now: Instant) {
        let task = &mut self.tasks[id];
        task.next_run = Some(now + task.def.retry_period);
        tracing::warn!(task = task.def.name, "task failed, scheduling retry");
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
