use crate::event::Event;
use ic_stable_structures::log::Log as StableLog;
use ic_stable_structures::memory_manager::{MemoryId, MemoryManager, VirtualMemory};
use ic_stable_structures::DefaultMemoryImpl;

type VMem = VirtualMemory<DefaultMemoryImpl>;

const LOG_INDEX_MEMORY_ID: MemoryId = MemoryId::new(0);
const LOG_DATA_MEMORY_ID: MemoryId = MemoryId::new(1);

/// Append-only log of CBOR-encoded events.
pub struct EventLog {
    log: StableLog<Vec<u8>, VMem, VMem>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").finish_non_exhaustive()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DefaultMemoryImpl::default())
    }
}

impl EventLog {
    pub fn new(memory: DefaultMemoryImpl) -> Self {
        let memory_manager = MemoryManager::init(memory);
        Self {
            log: StableLog::new(
                memory_manager.get(LOG_INDEX_MEMORY_ID),
                memory_manager.get(LOG_DATA_MEMORY_ID),
            ),
        }
    }

    /// Encodes and appends `event`.
    pub fn record(&self, event: &Event) {
        let bytes = encode_event(event);
        if let Err(err) = self.log.append(&bytes) {
            panic!("bug: failed to append an event to the log: {:?}", err);
        }
    }

    pub fn len(&self) -> u64 {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Decodes the recorded events in order.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.log.iter().map(|bytes| decode_event(&bytes))
    }
}

fn encode_event(event: &Event) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(err) = ciborium::ser::into_writer(event, &mut buf) {
        panic!("bug: failed to encode event {:?}: {}", event, err);
    }
    buf
}

fn decode_event(buf: &[u8]) -> Event {
    match ciborium::de::from_reader(buf) {
        Ok(event) => event,
        Err(err) => panic!("bug: failed to decode a recorded event: {}", err),
    }
}
