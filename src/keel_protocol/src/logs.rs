use ic_canister_log::declare_log_buffer;

// High-priority messages: one line per committed operation.
declare_log_buffer!(name = INFO, capacity = 1000);

// Low-priority details: mode switches, scale and epoch changes, skipped candidates.
declare_log_buffer!(name = DEBUG, capacity = 1000);
