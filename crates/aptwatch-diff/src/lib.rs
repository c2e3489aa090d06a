//! Pure diff engine: classifies a scraped listing set against the previous
//! active snapshot set into NEW / REMOVED / PRICE_UP / PRICE_DOWN / UNCHANGED.

use std::collections::HashMap;

use aptwatch_core::{ArticleChange, ChangeType, ListingSnapshot, RawListing};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aptwatch-diff";

/// Result of one diff cycle. `inserted`, `superseded` and `removed` describe
/// the row-level mutations the store must apply in one transaction;
/// `next_active` is the resulting active set as a whole.
#[derive(Debug, Clone, Default)]
pub struct DiffOutcome {
    pub next_active: Vec<ListingSnapshot>,
    /// New active rows to insert (fresh listings and superseding rows).
    pub inserted: Vec<ListingSnapshot>,
    /// Article numbers whose previous active row flips inactive because a
    /// superseding row replaces it.
    pub superseded: Vec<String>,
    /// Article numbers whose active row flips inactive with no replacement.
    pub removed: Vec<String>,
    pub changes: Vec<ArticleChange>,
    /// Scraped records dropped for missing identity. Never a failure.
    pub skipped_records: usize,
}

/// Price usable for delta computation: present and positive. Zero-price
/// listings never produce PRICE_UP/PRICE_DOWN.
fn effective_price(price: Option<i64>) -> Option<i64> {
    price.filter(|p| *p > 0)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Non-price fields whose drift supersedes the active row without emitting a
/// change record.
fn attributes_differ(prev: &ListingSnapshot, raw: &RawListing) -> bool {
    prev.trade_type != raw.trade_type
        || prev.price != raw.price
        || prev.area_name != raw.area_name
        || prev.area != raw.area
        || prev.floor_info != raw.floor_info
        || prev.direction != raw.direction
        || prev.building_name != raw.building_name
        || prev.realtor_name != raw.realtor_name
}

fn snapshot_from_raw(
    complex_id: &str,
    article_no: &str,
    raw: &RawListing,
    captured_at: DateTime<Utc>,
    first_seen_at: DateTime<Utc>,
    session_id: Uuid,
) -> ListingSnapshot {
    ListingSnapshot {
        complex_id: complex_id.to_string(),
        article_no: article_no.to_string(),
        trade_type: raw.trade_type.clone(),
        price: raw.price,
        area_name: raw.area_name.clone(),
        area: raw.area,
        floor_info: raw.floor_info.clone(),
        direction: raw.direction.clone(),
        building_name: raw.building_name.clone(),
        realtor_name: raw.realtor_name.clone(),
        is_active: true,
        captured_at,
        first_seen_at,
        crawl_session_id: session_id,
    }
}

/// Diff a scraped listing set against the previous active set for one
/// complex. Pure: no clock, no I/O, never fails on malformed listings.
pub fn diff(
    complex_id: &str,
    previous_active: &[ListingSnapshot],
    scraped: &[RawListing],
    captured_at: DateTime<Utc>,
    session_id: Uuid,
) -> DiffOutcome {
    let prev_map: HashMap<&str, &ListingSnapshot> = previous_active
        .iter()
        .map(|s| (s.article_no.as_str(), s))
        .collect();

    let mut curr_map: HashMap<&str, &RawListing> = HashMap::with_capacity(scraped.len());
    let mut skipped_records = 0usize;
    for raw in scraped {
        match raw.article_no.as_deref().map(str::trim) {
            Some(article_no) if !article_no.is_empty() => {
                curr_map.insert(article_no, raw);
            }
            _ => skipped_records += 1,
        }
    }

    let mut outcome = DiffOutcome {
        skipped_records,
        ..Default::default()
    };

    // Deterministic output order: scraped order for current listings,
    // previous-set order for removals.
    let mut seen: Vec<&str> = Vec::with_capacity(curr_map.len());
    for raw in scraped {
        if let Some(article_no) = raw.article_no.as_deref().map(str::trim) {
            if !article_no.is_empty() && !seen.contains(&article_no) {
                seen.push(article_no);
            }
        }
    }

    for article_no in seen {
        let raw = curr_map[article_no];
        match prev_map.get(article_no) {
            None => {
                let snapshot = snapshot_from_raw(
                    complex_id,
                    article_no,
                    raw,
                    captured_at,
                    captured_at,
                    session_id,
                );
                outcome.changes.push(ArticleChange {
                    id: None,
                    complex_id: complex_id.to_string(),
                    article_no: article_no.to_string(),
                    change_type: ChangeType::New,
                    old_price: None,
                    new_price: raw.price,
                    price_change_amount: None,
                    price_change_percent: None,
                    trade_type: raw.trade_type.clone(),
                    area_name: raw.area_name.clone(),
                    building_name: raw.building_name.clone(),
                    floor_info: raw.floor_info.clone(),
                    detected_at: captured_at,
                    crawl_session_id: session_id,
                });
                outcome.inserted.push(snapshot.clone());
                outcome.next_active.push(snapshot);
            }
            Some(prev) => {
                let moved = match (effective_price(prev.price), effective_price(raw.price)) {
                    (Some(old), Some(new)) if old != new => Some((old, new)),
                    _ => None,
                };
                let price_moved = moved.is_some();

                if let Some((old, new)) = moved {
                    let amount = new - old;
                    let change_type = if amount > 0 {
                        ChangeType::PriceUp
                    } else {
                        ChangeType::PriceDown
                    };
                    outcome.changes.push(ArticleChange {
                        id: None,
                        complex_id: complex_id.to_string(),
                        article_no: article_no.to_string(),
                        change_type,
                        old_price: Some(old),
                        new_price: Some(new),
                        price_change_amount: Some(amount),
                        price_change_percent: Some(round1(
                            amount as f64 / old as f64 * 100.0,
                        )),
                        trade_type: raw.trade_type.clone(),
                        area_name: raw.area_name.clone(),
                        building_name: raw.building_name.clone(),
                        floor_info: raw.floor_info.clone(),
                        detected_at: captured_at,
                        crawl_session_id: session_id,
                    });
                }

                if price_moved || attributes_differ(prev, raw) {
                    let snapshot = snapshot_from_raw(
                        complex_id,
                        article_no,
                        raw,
                        captured_at,
                        prev.first_seen_at,
                        session_id,
                    );
                    outcome.superseded.push(article_no.to_string());
                    outcome.inserted.push(snapshot.clone());
                    outcome.next_active.push(snapshot);
                } else {
                    // Byte-identical listing: carry the previous row forward,
                    // no duplicate row.
                    outcome.next_active.push((*prev).clone());
                }
            }
        }
    }

    for prev in previous_active {
        if !curr_map.contains_key(prev.article_no.as_str()) {
            outcome.changes.push(ArticleChange {
                id: None,
                complex_id: complex_id.to_string(),
                article_no: prev.article_no.clone(),
                change_type: ChangeType::Removed,
                old_price: prev.price,
                new_price: None,
                price_change_amount: None,
                price_change_percent: None,
                trade_type: prev.trade_type.clone(),
                area_name: prev.area_name.clone(),
                building_name: prev.building_name.clone(),
                floor_info: prev.floor_info.clone(),
                detected_at: captured_at,
                crawl_session_id: session_id,
            });
            outcome.removed.push(prev.article_no.clone());
        }
    }

    outcome
}
