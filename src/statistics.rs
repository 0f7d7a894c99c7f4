use crate::gate::WarmupSchedule;
use crate::ledger::{FailureReason, SendLedger};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Read-only summary of the ledger for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerStats {
    pub total_sent: usize,
    pub failed_send_error: usize,
    pub failed_bounce: usize,
    pub sending_days: usize,
    pub first_day: Option<NaiveDate>,
    pub last_day: Option<NaiveDate>,
    pub sent_per_day: BTreeMap<NaiveDate, usize>,
    pub next_daily_limit: usize,
}

impl LedgerStats {
    pub fn from_ledger(ledger: &SendLedger, schedule: &WarmupSchedule) -> Self {
        let mut sent_per_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for record in ledger.sent().values() {
            *sent_per_day.entry(record.date).or_default() += 1;
        }

        let (failed_send_error, failed_bounce) =
            ledger
                .failed()
                .values()
                .fold((0, 0), |(send_error, bounce), record| match record.reason {
                    FailureReason::SendError => (send_error + 1, bounce),
                    FailureReason::Bounce => (send_error, bounce + 1),
                });

        Self {
            total_sent: ledger.sent().len(),
            failed_send_error,
            failed_bounce,
            sending_days: sent_per_day.len(),
            first_day: sent_per_day.keys().next().copied(),
            last_day: sent_per_day.keys().next_back().copied(),
            next_daily_limit: schedule.daily_limit(sent_per_day.len()),
            sent_per_day,
        }
    }

    pub fn total_failed(&self) -> usize {
        self.failed_send_error + self.failed_bounce
    }

    pub fn print(&self) {
        println!("📊 Outreach Statistics");
        println!("═══════════════════════════════════════");
        println!();
        println!("  Total Sent: {}", self.total_sent);
        println!("  Failed: {}", self.total_failed());
        println!("  ├─ Send Errors: {}", self.failed_send_error);
        println!("  └─ Bounces: {}", self.failed_bounce);
        println!();
        match (self.first_day, self.last_day) {
            (Some(first), Some(last)) => {
                println!("  Sending Days: {} ({first} to {last})", self.sending_days);
            }
            _ => println!("  Sending Days: 0"),
        }
        println!("  Next Run Limit: {}", self.next_daily_limit);
        println!();

        if self.sent_per_day.is_empty() {
            println!("📭 Nothing sent yet");
            return;
        }
        println!("┌────────────┬───────┐");
        println!("│ Date       │  Sent │");
        println!("├────────────┼───────┤");
        for (day, count) in self.sent_per_day.iter().rev().take(14) {
            println!("│ {day} │ {count:>5} │");
        }
        println!("└────────────┴───────┘");
        if self.sent_per_day.len() > 14 {
            println!("  ... and {} earlier days", self.sent_per_day.len() - 14);
        }
    }
}
