use serde::Serialize;

/// Counters for one sync tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub dirty_entities: usize,
    pub messages_sent: usize,
    pub bytes_sent: usize,
    pub objects_created: usize,
    pub objects_removed: usize,
    pub elapsed_ms: f32,
    pub saved: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncTotals {
    pub ticks: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub saves: u64,
}

#[derive(Debug, Default)]
pub struct SyncTelemetry {
    latest: Option<TickReport>,
    totals: SyncTotals,
}

impl SyncTelemetry {
    pub fn record(&mut self, report: TickReport) {
        self.totals.ticks += 1;
        self.totals.messages_sent += report.messages_sent as u64;
        self.totals.bytes_sent += report.bytes_sent as u64;
        if report.saved {
            self.totals.saves += 1;
        }
        self.latest = Some(report);
    }

    pub fn latest(&self) -> Option<&TickReport> {
        self.latest.as_ref()
    }

    pub fn totals(&self) -> &SyncTotals {
        &self.totals
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.totals)
    }
}
