/// Naming for a published field across the JSON status stream and metrics.
#[derive(Debug, Clone, Copy)]
pub struct Tag {
    pub key: &'static str,
    pub metric: &'static str,
    pub help: &'static str,
}

pub const RUN_STATE: Tag = Tag {
    key: "state",
    metric: "boxstretch_run_state",
    help: "Run state (0=idle, 1=running)",
};

pub const CYCLES_COMPLETED: Tag = Tag {
    key: "cycles_completed",
    metric: "boxstretch_cycles_completed",
    help: "Cycles completed in the current run",
};

pub const CYCLES_TOTAL: Tag = Tag {
    key: "cycles_total",
    metric: "boxstretch_cycles_total",
    help: "Cycles requested for the current run",
};

pub const SECONDS_REMAINING: Tag = Tag {
    key: "estimated_seconds_remaining",
    metric: "boxstretch_seconds_remaining",
    help: "Estimated seconds until the current run completes",
};

pub const POSITION_MM: Tag = Tag {
    key: "position_mm",
    metric: "boxstretch_position_mm",
    help: "Last polled carriage position in millimetres",
};

pub const CONNECTED: Tag = Tag {
    key: "connected",
    metric: "boxstretch_connected",
    help: "Device link state (1=connected, 0=disconnected)",
};
