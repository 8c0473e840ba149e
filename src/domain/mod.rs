pub mod envelope;
pub mod frame;
pub mod round;

pub use envelope::{
    AuthFields, DocType, EventEnvelope, LeaderboardFields, OutboundEvent, PhaseChangeFields,
    PlayerFields, SideBetFields, SourceChangeFields, SourceKind, TickFields, TradeFields,
    TypedFields, SCHEMA_VERSION,
};
pub use frame::{DecodedEvent, Direction, RawFrame};
pub use round::{GameStateUpdate, Phase, PhaseOutcome, RoundEndReason, RoundState};
