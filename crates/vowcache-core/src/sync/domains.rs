//! The user-editable slices the app keeps optimistic state for.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::store::{OptimisticSyncStore, SyncDomain};
use crate::error::{Result, WriteOp};
use crate::store::{
    sort_quotes, FavoriteEdge, NotificationChannel, NotificationSettings, Quote, QuoteStatus,
    RecordStore, Table,
};

pub type FavoritesStore = OptimisticSyncStore<FavoritesDomain>;
pub type QuotesStore = OptimisticSyncStore<QuotesDomain>;
pub type NotificationsStore = OptimisticSyncStore<NotificationsDomain>;

// ===== Favorites =====

/// A user's favorited vendor ids.
#[derive(Debug, Clone)]
pub struct FavoritesDomain {
    user_id: String,
}

impl FavoritesDomain {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FavoriteAction {
    Toggle { vendor_id: String },
}

impl FavoriteAction {
    pub fn toggle(vendor_id: impl Into<String>) -> Self {
        FavoriteAction::Toggle {
            vendor_id: vendor_id.into(),
        }
    }
}

#[async_trait]
impl SyncDomain for FavoritesDomain {
    type Value = BTreeSet<String>;
    type Action = FavoriteAction;
    /// Whether the vendor is a favorite afterwards.
    type Outcome = bool;

    fn name(&self) -> &'static str {
        "favorites"
    }

    fn initial(&self) -> Self::Value {
        BTreeSet::new()
    }

    fn apply(&self, value: &mut Self::Value, action: &Self::Action) -> bool {
        let FavoriteAction::Toggle { vendor_id } = action;
        if value.remove(vendor_id) {
            false
        } else {
            value.insert(vendor_id.clone());
            true
        }
    }

    async fn persist(&self, records: &RecordStore, action: &Self::Action) -> Result<bool> {
        let FavoriteAction::Toggle { vendor_id } = action;
        records
            .toggle_favorite(&FavoriteEdge::new(&self.user_id, vendor_id))
            .await
    }

    async fn load(&self, records: &RecordStore) -> Result<Self::Value> {
        records.favorite_vendor_ids(&self.user_id).await
    }
}

// ===== Quotes =====

/// A user's quote requests, ordered by creation time.
#[derive(Debug, Clone)]
pub struct QuotesDomain {
    user_id: String,
}

impl QuotesDomain {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    fn owns(&self, quote: &Quote) -> bool {
        quote.user_id == self.user_id
    }

    /// Quotes created through this slice always belong to its user.
    fn owned(&self, quote: &Quote) -> Quote {
        Quote {
            user_id: self.user_id.clone(),
            ..quote.clone()
        }
    }
}

/// Timestamps travel with the action so the optimistic copy and the stored
/// row end up identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteAction {
    /// Insert, or replace a quote with the same id.
    Create(Quote),
    SetStatus {
        id: String,
        status: QuoteStatus,
        at: DateTime<Utc>,
    },
    Delete { id: String },
}

#[async_trait]
impl SyncDomain for QuotesDomain {
    type Value = Vec<Quote>;
    type Action = QuoteAction;
    /// Whether the action took effect on a quote owned by this user.
    type Outcome = bool;

    fn name(&self) -> &'static str {
        "quotes"
    }

    fn initial(&self) -> Self::Value {
        Vec::new()
    }

    fn apply(&self, quotes: &mut Self::Value, action: &Self::Action) -> bool {
        match action {
            QuoteAction::Create(quote) => {
                quotes.retain(|q| q.id != quote.id);
                quotes.push(self.owned(quote));
                sort_quotes(quotes);
                true
            }
            QuoteAction::SetStatus { id, status, at } => {
                match quotes.iter_mut().find(|q| &q.id == id) {
                    Some(quote) => {
                        quote.status = *status;
                        quote.updated_at = *at;
                        true
                    }
                    None => false,
                }
            }
            QuoteAction::Delete { id } => {
                let before = quotes.len();
                quotes.retain(|q| &q.id != id);
                quotes.len() != before
            }
        }
    }

    async fn persist(&self, records: &RecordStore, action: &Self::Action) -> Result<bool> {
        let (operation, id) = match action {
            QuoteAction::Create(quote) => (WriteOp::Upsert, quote.id.as_str()),
            QuoteAction::SetStatus { id, .. } => (WriteOp::Modify, id.as_str()),
            QuoteAction::Delete { id } => (WriteOp::Delete, id.as_str()),
        };

        records
            .transact(operation, id, &[Table::Quotes], |txn| {
                let current = txn.get::<Quote>(id)?;
                if current.as_ref().is_some_and(|q| !self.owns(q)) {
                    // Someone else's quote under the same id; leave it alone.
                    return Ok(false);
                }
                match action {
                    QuoteAction::Create(quote) => {
                        txn.put(&self.owned(quote))?;
                        Ok(true)
                    }
                    QuoteAction::SetStatus { status, at, .. } => match current {
                        Some(mut quote) => {
                            quote.status = *status;
                            quote.updated_at = *at;
                            txn.put(&quote)?;
                            Ok(true)
                        }
                        None => Ok(false),
                    },
                    QuoteAction::Delete { .. } => txn.delete::<Quote>(id),
                }
            })
            .await
    }

    async fn load(&self, records: &RecordStore) -> Result<Self::Value> {
        records.quotes_for(&self.user_id).await
    }
}

// ===== Notification settings =====

/// A user's notification preferences.
#[derive(Debug, Clone)]
pub struct NotificationsDomain {
    user_id: String,
}

impl NotificationsDomain {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    fn change(&self, settings: &mut NotificationSettings, action: &NotificationAction) {
        match action {
            NotificationAction::Replace(next) => {
                *settings = NotificationSettings {
                    user_id: self.user_id.clone(),
                    ..next.clone()
                };
            }
            NotificationAction::SetChannel { channel, enabled } => settings.set(*channel, *enabled),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationAction {
    Replace(NotificationSettings),
    SetChannel {
        channel: NotificationChannel,
        enabled: bool,
    },
}

#[async_trait]
impl SyncDomain for NotificationsDomain {
    type Value = NotificationSettings;
    type Action = NotificationAction;
    /// Settings after the change.
    type Outcome = NotificationSettings;

    fn name(&self) -> &'static str {
        "notifications"
    }

    fn initial(&self) -> Self::Value {
        NotificationSettings::defaults_for(&self.user_id)
    }

    fn apply(&self, value: &mut Self::Value, action: &Self::Action) -> NotificationSettings {
        self.change(value, action);
        value.clone()
    }

    async fn persist(
        &self,
        records: &RecordStore,
        action: &Self::Action,
    ) -> Result<NotificationSettings> {
        let updated = records
            .modify::<NotificationSettings>(&self.user_id, |current| {
                let mut settings =
                    current.unwrap_or_else(|| NotificationSettings::defaults_for(&self.user_id));
                self.change(&mut settings, action);
                Some(settings)
            })
            .await?;
        Ok(updated.unwrap_or_else(|| NotificationSettings::defaults_for(&self.user_id)))
    }

    async fn load(&self, records: &RecordStore) -> Result<Self::Value> {
        records.notification_settings(&self.user_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::sync::SyncPhase;

    fn quote(id: &str, minute: u32) -> Quote {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 0).unwrap();
        Quote {
            id: id.to_string(),
            user_id: "u1".to_string(),
            vendor_id: "v1".to_string(),
            event_date: None,
            guest_count: Some(120),
            message: "Available in June?".to_string(),
            status: QuoteStatus::Requested,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_favorites_apply_toggles() {
        let domain = FavoritesDomain::new("u1");
        let mut value = BTreeSet::new();

        assert!(domain.apply(&mut value, &FavoriteAction::toggle("v1")));
        assert!(value.contains("v1"));
        assert!(!domain.apply(&mut value, &FavoriteAction::toggle("v1")));
        assert!(value.is_empty());
    }

    #[test]
    fn test_quotes_apply_keeps_order_and_replaces_by_id() {
        let domain = QuotesDomain::new("u1");
        let mut value = Vec::new();

        domain.apply(&mut value, &QuoteAction::Create(quote("q2", 5)));
        domain.apply(&mut value, &QuoteAction::Create(quote("q1", 1)));
        domain.apply(&mut value, &QuoteAction::Create(quote("q1", 1)));

        let ids: Vec<&str> = value.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["q1", "q2"]);
    }

    #[test]
    fn test_quotes_apply_missing_id_reports_false() {
        let domain = QuotesDomain::new("u1");
        let mut value = vec![quote("q1", 1)];

        let at = Utc::now();
        let outcome = domain.apply(
            &mut value,
            &QuoteAction::SetStatus {
                id: "nope".to_string(),
                status: QuoteStatus::Accepted,
                at,
            },
        );
        assert!(!outcome);
        assert!(!domain.apply(&mut value, &QuoteAction::Delete { id: "nope".to_string() }));
        assert_eq!(value.len(), 1);
    }

    #[test]
    fn test_notifications_replace_keeps_owner() {
        let domain = NotificationsDomain::new("u1");
        let mut value = domain.initial();

        let mut other = NotificationSettings::defaults_for("someone-else");
        other.email_enabled = false;
        let result = domain.apply(&mut value, &NotificationAction::Replace(other));

        assert_eq!(result.user_id, "u1");
        assert!(!result.email_enabled);
    }

    #[tokio::test]
    async fn test_quotes_store_converges() {
        let records = Arc::new(RecordStore::in_memory());
        let quotes = QuotesStore::new(QuotesDomain::new("u1"), Arc::clone(&records));
        quotes.load().await.unwrap();

        quotes.mutate(QuoteAction::Create(quote("q1", 1)));
        quotes.mutate(QuoteAction::Create(quote("q2", 2)));
        quotes.mutate(QuoteAction::SetStatus {
            id: "q1".to_string(),
            status: QuoteStatus::Accepted,
            at: Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
        });
        quotes.mutate(QuoteAction::Delete { id: "q2".to_string() });

        let slice = quotes.settled().await;
        assert_eq!(slice.phase, SyncPhase::Idle);
        assert_eq!(slice.error, None);
        assert_eq!(slice.value, records.quotes_for("u1").await.unwrap());
        assert_eq!(slice.value.len(), 1);
        assert_eq!(slice.value[0].status, QuoteStatus::Accepted);
    }

    #[tokio::test]
    async fn test_quote_created_for_other_user_is_claimed() {
        let records = Arc::new(RecordStore::in_memory());
        let quotes = QuotesStore::new(QuotesDomain::new("u1"), Arc::clone(&records));
        quotes.load().await.unwrap();

        let mut foreign = quote("q1", 1);
        foreign.user_id = "u2".to_string();
        quotes.mutate(QuoteAction::Create(foreign));
        assert_eq!(quotes.snapshot().value[0].user_id, "u1");

        let slice = quotes.settled().await;
        let stored = records.quotes_for("u1").await.unwrap();
        assert_eq!(slice.error, None);
        assert_eq!(slice.value, stored);
        assert_eq!(stored.len(), 1);
        assert!(records.quotes_for("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_users_quote_is_untouched() {
        let records = Arc::new(RecordStore::in_memory());
        let mut theirs = quote("q1", 1);
        theirs.user_id = "u2".to_string();
        records.upsert(&theirs).await.unwrap();

        let quotes = QuotesStore::new(QuotesDomain::new("u1"), Arc::clone(&records));
        quotes.load().await.unwrap();

        // Same id as u2's quote: rejected by the store, slice reloads
        quotes.mutate(QuoteAction::Create(quote("q1", 2)));
        quotes.mutate(QuoteAction::Delete { id: "q1".to_string() });
        quotes.mutate(QuoteAction::SetStatus {
            id: "q1".to_string(),
            status: QuoteStatus::Declined,
            at: Utc::now(),
        });

        let slice = quotes.settled().await;
        assert_eq!(slice.value, records.quotes_for("u1").await.unwrap());
        assert!(slice.value.is_empty());
        assert_eq!(records.get::<Quote>("q1").await.unwrap(), Some(theirs));
    }

    #[tokio::test]
    async fn test_notifications_store_persists_channel() {
        let records = Arc::new(RecordStore::in_memory());
        let store = NotificationsStore::new(NotificationsDomain::new("u1"), Arc::clone(&records));
        store.load().await.unwrap();
        assert!(!store.snapshot().value.promotions);

        store.mutate(NotificationAction::SetChannel {
            channel: NotificationChannel::Promotions,
            enabled: true,
        });
        assert!(store.snapshot().value.promotions);

        let slice = store.settled().await;
        assert!(slice.value.promotions);
        assert_eq!(slice.value, records.notification_settings("u1").await.unwrap());
    }
}
