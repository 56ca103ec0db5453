use crate::event::EventMeta;

/// An event together with its metadata.
///
/// This is the unit written to (and decoded from) one line of a stored
/// batch. Decoding splices the metadata line back onto the typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope<E> {
    meta: EventMeta,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(meta: EventMeta, payload: E) -> Self {
        Self { meta, payload }
    }

    pub fn meta(&self) -> &EventMeta {
        &self.meta
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    pub fn into_parts(self) -> (EventMeta, E) {
        (self.meta, self.payload)
    }

    /// Re-wrap the payload, keeping the metadata.
    pub fn map<F, T>(self, f: F) -> EventEnvelope<T>
    where
        F: FnOnce(E) -> T,
    {
        EventEnvelope {
            meta: self.meta,
            payload: f(self.payload),
        }
    }
}
