//! # Master Schedule
//!
//! The concrete task graph a master runs against one outstation:
//!
//! ```text
//! unsol disable ──▶ integrity poll ──▶ unsol enable
//!                        │
//!                        └──▶ class scans (user-added)
//! ```
//!
//! Unsolicited reporting is disabled before the integrity scan and re-enabled
//! only after it completes, per the application-layer procedure. Command,
//! time-sync, and clear-restart tasks are continuous: they run when demanded
//! and outrank the polls.

use quanta::Instant;
use std::time::Duration;

use gridlink_protocol::apdu::IinField;
use gridlink_protocol::config::{MasterConfig, TimeSyncMode};
use gridlink_protocol::measurement::ClassMask;

use crate::scheduler::{
    TaskDef, TaskFlags, TaskGroup, TaskId, PRIORITY_CLEAR_RESTART, PRIORITY_COMMAND,
    PRIORITY_POLL, PRIORITY_TIME_SYNC, PRIORITY_UNSOL_CHANGE,
};

/// The standing master tasks and their group.
pub struct MasterSchedule {
    pub group: TaskGroup,
    pub integrity_poll: TaskId,
    pub unsol_disable: Option<TaskId>,
    pub unsol_enable: Option<TaskId>,
    pub command: TaskId,
    pub time_sync: TaskId,
    pub clear_restart: TaskId,
    /// Classes the unsol-enable task requests.
    pub unsol_mask: ClassMask,
    time_sync_mode: TimeSyncMode,
}

impl MasterSchedule {
    pub fn new(config: &MasterConfig) -> Self {
        let mut group = TaskGroup::new();

        let integrity_poll = group.add(TaskDef {
            name: "integrity poll",
            priority: PRIORITY_POLL,
            period: Some(config.integrity_rate),
            retry_period: config.task_retry_rate,
            flags: TaskFlags::ONLINE_ONLY | TaskFlags::START_UP,
        });

        let mut unsol_disable = None;
        let mut unsol_enable = None;
        if config.unsol_on_startup {
            // Unsolicited reporting is silenced before the integrity scan.
            let disable = group.add(TaskDef {
                name: "unsol disable",
                priority: PRIORITY_UNSOL_CHANGE,
                period: None,
                retry_period: config.task_retry_rate,
                flags: TaskFlags::ONLINE_ONLY | TaskFlags::START_UP,
            });
            group.add_dependency(integrity_poll, disable);
            unsol_disable = Some(disable);

            if config.enable_unsol {
                let enable = group.add(TaskDef {
                    name: "unsol enable",
                    priority: PRIORITY_UNSOL_CHANGE,
                    period: None,
                    retry_period: config.task_retry_rate,
                    flags: TaskFlags::ONLINE_ONLY | TaskFlags::START_UP,
                });
                group.add_dependency(enable, integrity_poll);
                unsol_enable = Some(enable);
            }
        }

        // Continuous tasks, run when demanded while the master is idle.
        let command = group.add(TaskDef {
            name: "command",
            priority: PRIORITY_COMMAND,
            period: None,
            retry_period: config.task_retry_rate,
            flags: TaskFlags::empty(),
        });
        let time_sync = group.add(TaskDef {
            name: "time sync",
            priority: PRIORITY_TIME_SYNC,
            period: None,
            retry_period: config.task_retry_rate,
            flags: TaskFlags::ONLINE_ONLY,
        });
        let clear_restart = group.add(TaskDef {
            name: "clear restart",
            priority: PRIORITY_CLEAR_RESTART,
            period: None,
            retry_period: config.task_retry_rate,
            flags: TaskFlags::ONLINE_ONLY,
        });

        MasterSchedule {
            group,
            integrity_poll,
            unsol_disable,
            unsol_enable,
            command,
            time_sync,
            clear_restart,
            unsol_mask: config.unsol_class_mask,
            time_sync_mode: config.time_sync_mode,
        }
    }

    /// React to the IIN bits of a received response: demand the continuous
    /// tasks the outstation is asking for.
    pub fn on_response_iin(&mut self, iin: IinField, now: Instant) {
        if iin.contains(IinField::NEED_TIME) && self.time_sync_mode == TimeSyncMode::OnNeedTime {
            self.group.demand(self.time_sync, now);
        }
        if iin.contains(IinField::DEVICE_RESTART) {
            self.group.demand(self.clear_restart, now);
        }
    }

    /// Add a periodic class scan. Scans run only after the integrity poll
    /// has completed once.
    pub fn add_class_scan(
        &mut self,
        scan_rate: Duration,
        retry_rate: Duration,
    ) -> TaskId {
        let scan = self.group.add(TaskDef {
            name: "class scan",
            priority: PRIORITY_POLL,
            period: Some(scan_rate),
            retry_period: retry_rate,
            flags: TaskFlags::ONLINE_ONLY,
        });
        self.group.add_dependency(scan, self.integrity_poll);
        scan
    }

    pub fn on_link_up(&mut self, now: Instant) {
        self.group.on_link_up(now);
    }

    pub fn on_link_down(&mut self) {
        self.group.on_link_down();
    }
}
