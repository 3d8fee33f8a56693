pub mod idempotency_record;

pub use idempotency_record::{
    IdempotencyRecord, NewIdempotencyRecord, RecordState, RecordStateMachine, ValidationError,
    MAX_KEY_LENGTH, MAX_SCOPE_LENGTH,
};
