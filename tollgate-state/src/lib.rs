// tollgate-state/src/lib.rs
//! Persistent state for the toll backend: reader registry, nonce ledger,
//! card balances, the append-only decision log, and the quarantine /
//! challenge / vote records driving the self-healing lifecycle.

pub mod card;
pub mod decision;
pub mod nonce;
pub mod reader;
pub mod records;

pub use card::{Card, CardStore, Tariff, VehicleType};
pub use decision::{Decision, DecisionRecord, DecisionStore};
pub use nonce::{NonceLedger, NonceRecord};
pub use reader::{Reader, ReaderCounters, ReaderStatus, ReaderStore};
pub use records::{
    ChallengeKind, ConsensusRound, PeerVote, ProbationChallenge, Quarantine, RecordStore,
    SuspectTag, Vote,
};

use std::sync::Arc;
use tollgate_common::{database::TollDatabase, error::TollResult};

/// Facade bundling every typed store over one database handle.
pub struct TollState {
    pub db: Arc<TollDatabase>,
    pub readers: ReaderStore,
    pub nonces: NonceLedger,
    pub cards: CardStore,
    pub decisions: DecisionStore,
    pub records: RecordStore,
}

impl TollState {
    /// Open (or create) all stores at the given path.
    pub async fn open(path: &str) -> TollResult<Self> {
        let db = Arc::new(TollDatabase::new(path)?);
        Self::with_db(db).await
    }

    /// Build the facade over an existing database handle.
    pub async fn with_db(db: Arc<TollDatabase>) -> TollResult<Self> {
        Ok(Self {
            readers: ReaderStore::new(db.clone()),
            nonces: NonceLedger::new(db.clone()),
            cards: CardStore::new(db.clone()),
            decisions: DecisionStore::open(db.clone()).await?,
            records: RecordStore::new(db.clone()),
            db,
        })
    }
}
