//! Card balances and the tariff table

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tollgate_common::{
    database::{StoreOps, TollDatabase},
    error::{TollError, TollResult},
    serialization::{EncodingType, TollSerialize},
    types::{keyspace, TagHash},
};

/// Vehicle classes recognized by the tariff table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleType {
    /// Lowercase identifier matching the policy's per-type ceilings.
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Car => "car",
            VehicleType::Motorcycle => "motorcycle",
            VehicleType::Bus => "bus",
            VehicleType::Truck => "truck",
        }
    }
}

/// One stored-value card, keyed by tag hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub tag_hash: TagHash,
    pub balance: u64,
    pub vehicle_type: VehicleType,
    pub tariff_class: String,
}

impl TollSerialize for Card {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// One tariff table row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tariff {
    pub tariff_class: String,
    pub amount: u64,
}

impl TollSerialize for Tariff {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Bincode
    }
}

/// Typed store over cards and tariffs.
#[derive(Clone)]
pub struct CardStore {
    db: Arc<TollDatabase>,
}

impl CardStore {
    pub fn new(db: Arc<TollDatabase>) -> Self {
        Self { db }
    }

    pub async fn get(&self, tag_hash: &str) -> TollResult<Option<Card>> {
        self.db.load_data(keyspace::CARD_PREFIX, tag_hash).await
    }

    pub async fn put(&self, card: &Card) -> TollResult<()> {
        self.db
            .store_data(keyspace::CARD_PREFIX, &card.tag_hash, card)
            .await
    }

    /// Deduct `amount` from the card, failing without mutation if the
    /// balance is insufficient. Returns the new balance.
    pub async fn deduct(&self, tag_hash: &str, amount: u64) -> TollResult<u64> {
        let mut card = self
            .get(tag_hash)
            .await?
            .ok_or_else(|| TollError::state(format!("unknown card {}", tag_hash)))?;

        if card.balance < amount {
            return Err(TollError::state(format!(
                "insufficient balance on {}: {} < {}",
                tag_hash, card.balance, amount
            )));
        }

        card.balance -= amount;
        self.put(&card).await?;
        Ok(card.balance)
    }

    /// Rollback of a deduction after a downstream failure.
    pub async fn refund(&self, tag_hash: &str, amount: u64) -> TollResult<u64> {
        let mut card = self
            .get(tag_hash)
            .await?
            .ok_or_else(|| TollError::state(format!("unknown card {}", tag_hash)))?;

        card.balance = card.balance.saturating_add(amount);
        self.put(&card).await?;
        Ok(card.balance)
    }

    pub async fn tariff(&self, tariff_class: &str) -> TollResult<Option<Tariff>> {
        self.db
            .load_data(keyspace::TARIFF_PREFIX, tariff_class)
            .await
    }

    pub async fn put_tariff(&self, tariff: &Tariff) -> TollResult<()> {
        self.db
            .store_data(keyspace::TARIFF_PREFIX, &tariff.tariff_class, tariff)
            .await
    }

    /// Toll amount owed by a card, from its tariff class.
    pub async fn amount_for(&self, card: &Card) -> TollResult<u64> {
        let tariff = self.tariff(&card.tariff_class).await?.ok_or_else(|| {
            TollError::state(format!("unknown tariff class {}", card.tariff_class))
        })?;
        Ok(tariff.amount)
    }
}
