//! Entity types persisted by the record store.
//!
//! Every entity implements [`Record`], which names its table and derives a
//! stable identity key. Nested vendor rows (services, styles, images,
//! reviews) point back at their vendor through `vendor_id`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Separator between the parts of a composite identity key.
const KEY_SEPARATOR: char = '#';

/// Escape character for `KEY_SEPARATOR` (and itself) inside key parts.
const KEY_ESCAPE: char = '%';

/// Join two parts so that distinct pairs never produce the same key, even
/// when a part contains the separator.
fn composite_key(a: &str, b: impl std::fmt::Display) -> String {
    format!("{}{}{}", escape_key_part(a), KEY_SEPARATOR, escape_key_part(&b.to_string()))
}

fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            KEY_ESCAPE => escaped.push_str("%25"),
            KEY_SEPARATOR => escaped.push_str("%23"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// One collection per entity family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Vendors,
    VendorServices,
    VendorStyles,
    VendorImages,
    Reviews,
    Favorites,
    Quotes,
    SearchHistory,
    NotificationSettings,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Vendors,
        Table::VendorServices,
        Table::VendorStyles,
        Table::VendorImages,
        Table::Reviews,
        Table::Favorites,
        Table::Quotes,
        Table::SearchHistory,
        Table::NotificationSettings,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Vendors => "vendors",
            Table::VendorServices => "vendor_services",
            Table::VendorStyles => "vendor_styles",
            Table::VendorImages => "vendor_images",
            Table::Reviews => "reviews",
            Table::Favorites => "favorites",
            Table::Quotes => "quotes",
            Table::SearchHistory => "search_history",
            Table::NotificationSettings => "notification_settings",
        }
    }

    /// Position in [`Table::ALL`].
    pub(crate) fn slot(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A persisted entity with a stable identity.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: Table;

    /// Identity key; upserting two records with the same key keeps one row.
    fn key(&self) -> String;
}

// ===== Vendors =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Vendor {
    pub id: String,
    pub name: String,
    pub category: String,
    pub location: Option<String>,
    pub price_range: Option<String>,
    pub description: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub cover_image_url: Option<String>,
    /// Average review rating, recomputed when reviews are submitted.
    pub rating: Option<f32>,
    pub review_count: u32,
}

impl Record for Vendor {
    const TABLE: Table = Table::Vendors;

    fn key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct VendorService {
    pub vendor_id: String,
    pub position: u32,
    pub name: String,
    pub price: Option<String>,
}

impl Record for VendorService {
    const TABLE: Table = Table::VendorServices;

    fn key(&self) -> String {
        composite_key(&self.vendor_id, self.position)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct VendorStyle {
    pub vendor_id: String,
    pub style: String,
}

impl Record for VendorStyle {
    const TABLE: Table = Table::VendorStyles;

    fn key(&self) -> String {
        composite_key(&self.vendor_id, &self.style)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct VendorImage {
    pub vendor_id: String,
    pub position: u32,
    pub url: String,
    pub caption: Option<String>,
}

impl Record for VendorImage {
    const TABLE: Table = Table::VendorImages;

    fn key(&self) -> String {
        composite_key(&self.vendor_id, self.position)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Review {
    pub id: String,
    pub vendor_id: String,
    pub user_id: String,
    /// 1 to 5 stars
    pub rating: u8,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Record for Review {
    const TABLE: Table = Table::Reviews;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// A vendor together with its nested rows, written as one atomic batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct VendorBundle {
    pub vendor: Vendor,
    #[serde(default)]
    pub services: Vec<VendorService>,
    #[serde(default)]
    pub styles: Vec<VendorStyle>,
    #[serde(default)]
    pub images: Vec<VendorImage>,
    #[serde(default)]
    pub reviews: Vec<Review>,
}

// ===== Favorites =====

/// Membership of a vendor in a user's favorites. Unique per (user, vendor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct FavoriteEdge {
    pub user_id: String,
    pub vendor_id: String,
}

impl FavoriteEdge {
    pub fn new(user_id: impl Into<String>, vendor_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            vendor_id: vendor_id.into(),
        }
    }
}

impl Record for FavoriteEdge {
    const TABLE: Table = Table::Favorites;

    fn key(&self) -> String {
        composite_key(&self.user_id, &self.vendor_id)
    }
}

// ===== Quotes =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    #[default]
    Requested,
    Responded,
    Accepted,
    Declined,
}

impl QuoteStatus {
    pub fn display_name(&self) -> &'static str {
        match self {
            QuoteStatus::Requested => "Requested",
            QuoteStatus::Responded => "Responded",
            QuoteStatus::Accepted => "Accepted",
            QuoteStatus::Declined => "Declined",
        }
    }
}

/// A quote request sent to a vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Quote {
    pub id: String,
    pub user_id: String,
    pub vendor_id: String,
    pub event_date: Option<NaiveDate>,
    pub guest_count: Option<u32>,
    pub message: String,
    pub status: QuoteStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for Quote {
    const TABLE: Table = Table::Quotes;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// Canonical ordering for a user's quotes: oldest first, ties by id.
pub fn sort_quotes(quotes: &mut [Quote]) {
    quotes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

// ===== Search History =====

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SearchHistoryEntry {
    pub user_id: String,
    pub query: String,
    pub searched_at: DateTime<Utc>,
}

impl SearchHistoryEntry {
    /// Case and surrounding whitespace do not make a search distinct.
    pub fn normalize(query: &str) -> String {
        query.trim().to_lowercase()
    }
}

impl Record for SearchHistoryEntry {
    const TABLE: Table = Table::SearchHistory;

    fn key(&self) -> String {
        composite_key(&self.user_id, Self::normalize(&self.query))
    }
}

// ===== Notification Settings =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationChannel {
    Push,
    Email,
    QuoteUpdates,
    Promotions,
    Reminders,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct NotificationSettings {
    pub user_id: String,
    pub push_enabled: bool,
    pub email_enabled: bool,
    pub quote_updates: bool,
    pub promotions: bool,
    pub reminders: bool,
}

impl NotificationSettings {
    /// Settings a user has before changing anything.
    pub fn defaults_for(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            push_enabled: true,
            email_enabled: true,
            quote_updates: true,
            promotions: false,
            reminders: true,
        }
    }

    pub fn get(&self, channel: NotificationChannel) -> bool {
        match channel {
            NotificationChannel::Push => self.push_enabled,
            NotificationChannel::Email => self.email_enabled,
            NotificationChannel::QuoteUpdates => self.quote_updates,
            NotificationChannel::Promotions => self.promotions,
            NotificationChannel::Reminders => self.reminders,
        }
    }

    pub fn set(&mut self, channel: NotificationChannel, enabled: bool) {
        let field = match channel {
            NotificationChannel::Push => &mut self.push_enabled,
            NotificationChannel::Email => &mut self.email_enabled,
            NotificationChannel::QuoteUpdates => &mut self.quote_updates,
            NotificationChannel::Promotions => &mut self.promotions,
            NotificationChannel::Reminders => &mut self.reminders,
        };
        *field = enabled;
    }
}

impl Record for NotificationSettings {
    const TABLE: Table = Table::NotificationSettings;

    fn key(&self) -> String {
        self.user_id.clone()
    }
}
