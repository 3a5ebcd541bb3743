//! Export Core - Epsilon-Domain Bar Analytics
//!
//! Building blocks for turning one bar's depth and trade clusters into a
//! normalized `BarRecord`. Everything here is synchronous and side-effect free
//! except the writer.
//!
//! # Architecture
//!
//! ```text
//! raw depth levels → split_book → DimensionNormalizer (fixed W, compression)
//!     ↓
//! StalenessDetector (exact repeat of ask vector, degrade after K)
//!     ↓
//! UrgencyScorer + liquidity (volume only, no prices)
//!     ↓
//! EnergyValidator (conservation within ε, shape check → signatures)
//!     ↓
//! BarRecord → RecordWriterBackend → {prefix}_{YYYYMMDD}.jsonl
//! ```

pub mod jsonl_writer;
pub mod normalizer;
pub mod record;
pub mod scorer;
pub mod staleness;
pub mod validator;
pub mod writer_backend;

pub use jsonl_writer::BufferedJsonlWriter;
pub use normalizer::{
    split_book, BookSide, DimensionError, DimensionNormalizer, LevelEntry, NormalizedLevels,
    SplitBook,
};
pub use record::{
    BarRecord, ClusterSnapshot, EnergyCluster, EpsilonSource, Header, Liquidity, MifCompliance,
    Ohlcv, Signatures, TradeFlow, UrgencyOut, ValidationView, SCHEMA_VERSION, WINDOW_CONVENTION,
};
pub use scorer::{liquidity, CombineMode, UrgencyScorer, POTENTIAL_FLOOR};
pub use staleness::{Freshness, StalenessDetector};
pub use validator::{ConservationCheck, EnergyValidator};
pub use writer_backend::{RecordWriterBackend, WriterError};
