//! Domain-level operations on the record store.
//!
//! These are the queries and writes the app's screens need, expressed on top
//! of the generic `RecordStore` primitives.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::debug;

use super::record_store::RecordStore;
use super::records::{
    sort_quotes, FavoriteEdge, NotificationSettings, Quote, Record, Review, SearchHistoryEntry,
    Table, Vendor, VendorBundle, VendorImage, VendorService, VendorStyle,
};
use crate::error::{Result, WriteOp};

/// Tables a vendor bundle spans.
const VENDOR_TABLES: [Table; 5] = [
    Table::Vendors,
    Table::VendorServices,
    Table::VendorStyles,
    Table::VendorImages,
    Table::Reviews,
];

/// Default number of recent searches returned to the search screen.
pub const RECENT_SEARCH_LIMIT: usize = 10;

impl RecordStore {
    // ===== Vendors =====

    /// Write a vendor and everything nested under it as one atomic batch.
    ///
    /// Services, styles and images previously stored for the vendor are
    /// replaced, so seeding the same bundle twice leaves no duplicates.
    /// Reviews are upserted by id and never removed here.
    pub async fn seed_vendor(&self, bundle: &VendorBundle) -> Result<()> {
        let vendor_id = bundle.vendor.id.clone();
        self.transact(WriteOp::Batch, &vendor_id, &VENDOR_TABLES, |txn| {
            txn.put(&bundle.vendor)?;

            txn.delete_where(|s: &VendorService| s.vendor_id == vendor_id)?;
            txn.delete_where(|s: &VendorStyle| s.vendor_id == vendor_id)?;
            txn.delete_where(|i: &VendorImage| i.vendor_id == vendor_id)?;

            for service in &bundle.services {
                txn.put(service)?;
            }
            for style in &bundle.styles {
                txn.put(style)?;
            }
            for image in &bundle.images {
                txn.put(image)?;
            }
            for review in &bundle.reviews {
                txn.put(review)?;
            }
            Ok(())
        })
        .await?;

        debug!(
            vendor_id = %bundle.vendor.id,
            images = bundle.images.len(),
            services = bundle.services.len(),
            "Vendor seeded"
        );
        Ok(())
    }

    /// Vendor with its nested rows, read from one consistent view.
    pub async fn vendor_bundle(&self, vendor_id: &str) -> Result<Option<VendorBundle>> {
        self.read(&VENDOR_TABLES, |view| {
            let Some(vendor) = view.get::<Vendor>(vendor_id)? else {
                return Ok(None);
            };

            let mut services = view.find(|s: &VendorService| s.vendor_id == vendor_id)?;
            services.sort_by_key(|s| s.position);
            let styles = view.find(|s: &VendorStyle| s.vendor_id == vendor_id)?;
            let mut images = view.find(|i: &VendorImage| i.vendor_id == vendor_id)?;
            images.sort_by_key(|i| i.position);
            let mut reviews = view.find(|r: &Review| r.vendor_id == vendor_id)?;
            reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at));

            Ok(Some(VendorBundle {
                vendor,
                services,
                styles,
                images,
                reviews,
            }))
        })
        .await
    }

    pub async fn vendors_in_category(&self, category: &str) -> Result<Vec<Vendor>> {
        let mut vendors = self
            .query(|v: &Vendor| v.category.eq_ignore_ascii_case(category))
            .await?;
        vendors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vendors)
    }

    // ===== Reviews =====

    /// Store a review and refresh the vendor's rating and review count in
    /// the same write.
    pub async fn submit_review(&self, review: &Review) -> Result<()> {
        let vendor_id = review.vendor_id.clone();
        self.transact(WriteOp::Upsert, &review.key(), &[Table::Vendors, Table::Reviews], |txn| {
            txn.put(review)?;

            let reviews = txn.find(|r: &Review| r.vendor_id == vendor_id)?;
            if let Some(mut vendor) = txn.get::<Vendor>(&vendor_id)? {
                let total: u32 = reviews.iter().map(|r| u32::from(r.rating)).sum();
                vendor.review_count = reviews.len() as u32;
                vendor.rating = if reviews.is_empty() {
                    None
                } else {
                    Some(total as f32 / reviews.len() as f32)
                };
                txn.put(&vendor)?;
            }
            Ok(())
        })
        .await
    }

    /// Reviews for a vendor, newest first.
    pub async fn reviews_for(&self, vendor_id: &str) -> Result<Vec<Review>> {
        let mut reviews = self.query(|r: &Review| r.vendor_id == vendor_id).await?;
        reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(reviews)
    }

    // ===== Favorites =====

    pub async fn favorite_vendor_ids(&self, user_id: &str) -> Result<BTreeSet<String>> {
        let edges = self.query(|e: &FavoriteEdge| e.user_id == user_id).await?;
        Ok(edges.into_iter().map(|e| e.vendor_id).collect())
    }

    pub async fn is_favorite(&self, user_id: &str, vendor_id: &str) -> Result<bool> {
        let key = FavoriteEdge::new(user_id, vendor_id).key();
        Ok(self.get::<FavoriteEdge>(&key).await?.is_some())
    }

    // ===== Quotes =====

    /// A user's quotes in canonical order (see [`sort_quotes`]).
    pub async fn quotes_for(&self, user_id: &str) -> Result<Vec<Quote>> {
        let mut quotes = self.query(|q: &Quote| q.user_id == user_id).await?;
        sort_quotes(&mut quotes);
        Ok(quotes)
    }

    // ===== Search History =====

    /// Remember a search. Repeating a query refreshes its timestamp instead
    /// of adding a row; blank queries are ignored.
    pub async fn record_search(&self, user_id: &str, query: &str) -> Result<()> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(());
        }
        self.upsert(&SearchHistoryEntry {
            user_id: user_id.to_string(),
            query: query.to_string(),
            searched_at: Utc::now(),
        })
        .await
    }

    /// Most recent searches first.
    pub async fn recent_searches(&self, user_id: &str, limit: usize) -> Result<Vec<SearchHistoryEntry>> {
        let mut entries = self
            .query(|e: &SearchHistoryEntry| e.user_id == user_id)
            .await?;
        entries.sort_by(|a, b| b.searched_at.cmp(&a.searched_at));
        entries.truncate(limit);
        Ok(entries)
    }

    // ===== Notification Settings =====

    /// Stored settings, or the defaults for a user who never changed them.
    pub async fn notification_settings(&self, user_id: &str) -> Result<NotificationSettings> {
        Ok(self
            .get::<NotificationSettings>(user_id)
            .await?
            .unwrap_or_else(|| NotificationSettings::defaults_for(user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bundle(image_count: u32) -> VendorBundle {
        VendorBundle {
            vendor: Vendor {
                id: "v1".to_string(),
                name: "Bloom & Co".to_string(),
                category: "Florist".to_string(),
                location: Some("Austin, TX".to_string()),
                price_range: Some("$$".to_string()),
                description: None,
                contact_email: None,
                contact_phone: None,
                cover_image_url: Some("https://img/v1/cover.jpg".to_string()),
                rating: None,
                review_count: 0,
            },
            services: vec![VendorService {
                vendor_id: "v1".to_string(),
                position: 0,
                name: "Bridal bouquet".to_string(),
                price: Some("$250".to_string()),
            }],
            styles: vec![VendorStyle {
                vendor_id: "v1".to_string(),
                style: "rustic".to_string(),
            }],
            images: (0..image_count)
                .map(|position| VendorImage {
                    vendor_id: "v1".to_string(),
                    position,
                    url: format!("https://img/v1/{}.jpg", position),
                    caption: None,
                })
                .collect(),
            reviews: Vec::new(),
        }
    }

    fn review(id: &str, rating: u8, age_days: i64) -> Review {
        Review {
            id: id.to_string(),
            vendor_id: "v1".to_string(),
            user_id: "u1".to_string(),
            rating,
            body: "Lovely".to_string(),
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[tokio::test]
    async fn test_seed_vendor_twice_no_duplicates() {
        let store = RecordStore::in_memory();
        store.seed_vendor(&bundle(3)).await.unwrap();
        store.seed_vendor(&bundle(3)).await.unwrap();

        assert_eq!(store.count::<Vendor>().await, 1);
        assert_eq!(store.count::<VendorImage>().await, 3);
        assert_eq!(store.count::<VendorService>().await, 1);
    }

    #[tokio::test]
    async fn test_seed_vendor_replaces_stale_images() {
        let store = RecordStore::in_memory();
        store.seed_vendor(&bundle(3)).await.unwrap();
        store.seed_vendor(&bundle(1)).await.unwrap();

        let loaded = store.vendor_bundle("v1").await.unwrap().unwrap();
        assert_eq!(loaded.images.len(), 1);
        assert_eq!(loaded, bundle(1));
    }

    #[tokio::test]
    async fn test_vendor_bundle_missing() {
        let store = RecordStore::in_memory();
        assert!(store.vendor_bundle("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_vendors_in_category() {
        let store = RecordStore::in_memory();
        store.seed_vendor(&bundle(0)).await.unwrap();
        assert_eq!(store.vendors_in_category("florist").await.unwrap().len(), 1);
        assert!(store.vendors_in_category("caterer").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_review_updates_rating() {
        let store = RecordStore::in_memory();
        store.seed_vendor(&bundle(0)).await.unwrap();
        store.submit_review(&review("r1", 5, 2)).await.unwrap();
        store.submit_review(&review("r2", 4, 1)).await.unwrap();
        // Resubmitting the same review does not double count
        store.submit_review(&review("r2", 4, 1)).await.unwrap();

        let vendor: Vendor = store.get("v1").await.unwrap().unwrap();
        assert_eq!(vendor.review_count, 2);
        assert_eq!(vendor.rating, Some(4.5));

        let ids: Vec<_> = store
            .reviews_for("v1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["r2", "r1"]);
    }

    #[tokio::test]
    async fn test_favorite_ids() {
        let store = RecordStore::in_memory();
        store.toggle_favorite(&FavoriteEdge::new("u1", "v2")).await.unwrap();
        store.toggle_favorite(&FavoriteEdge::new("u1", "v1")).await.unwrap();
        store.toggle_favorite(&FavoriteEdge::new("u2", "v3")).await.unwrap();

        let ids: Vec<_> = store.favorite_vendor_ids("u1").await.unwrap().into_iter().collect();
        assert_eq!(ids, vec!["v1", "v2"]);
        assert!(store.is_favorite("u2", "v3").await.unwrap());
        assert!(!store.is_favorite("u1", "v3").await.unwrap());
    }

    #[tokio::test]
    async fn test_record_search_dedupes_and_orders() {
        let store = RecordStore::in_memory();
        store.record_search("u1", "florists").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.record_search("u1", "DJs").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.record_search("u1", "  Florists ").await.unwrap();
        store.record_search("u1", "   ").await.unwrap();

        let recent = store.recent_searches("u1", RECENT_SEARCH_LIMIT).await.unwrap();
        let queries: Vec<_> = recent.iter().map(|e| e.query.as_str()).collect();
        assert_eq!(queries, vec!["Florists", "DJs"]);

        assert_eq!(store.recent_searches("u1", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notification_settings_default() {
        let store = RecordStore::in_memory();
        assert_eq!(
            store.notification_settings("u1").await.unwrap(),
            NotificationSettings::defaults_for("u1")
        );
    }
}
