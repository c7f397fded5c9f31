//! Ledger aggregation: the ledger-derived value a cached balance must equal.
//!
//! Everything here is a pure function over an already-loaded set of entries.
//! Sums and orphans count live (not soft-deleted) unpaid entries only.
//! Duplicate grouping also sees paid entries, since a payout does not make a
//! second increment for the same source legitimate.

use crate::domain::{BalanceField, CausalSource, Cents, Currency, LedgerEntry};
use serde::Serialize;
use std::collections::BTreeMap;

/// Sums of `issued_net` and `holding_net` over live unpaid entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub issued: Cents,
    pub holding: Cents,
}

impl LedgerTotals {
    pub fn of<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a LedgerEntry>,
    {
        entries
            .into_iter()
            .filter(|e| counts(e))
            .fold(Self::default(), |mut totals, e| {
                totals.issued += e.issued_net;
                totals.holding += e.holding_net;
                totals
            })
    }

    /// The figure that should be cached in `field`.
    pub fn get(&self, field: BalanceField) -> Cents {
        match field {
            BalanceField::Amount => self.issued,
            BalanceField::HoldingAmount => self.holding,
        }
    }
}

fn counts(entry: &LedgerEntry) -> bool {
    !entry.is_deleted() && entry.is_unpaid()
}

/// Held amount sitting in one processor sub-account, in one currency.
pub fn merchant_holding<'a, I>(entries: I, merchant_account_id: &str, currency: &Currency) -> Cents
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    entries
        .into_iter()
        .filter(|e| counts(e))
        .filter(|e| e.merchant_account_id.as_deref() == Some(merchant_account_id))
        .filter(|e| &e.currency == currency)
        .map(|e| e.holding_net)
        .sum()
}

/// Live entries, paid or not, grouped by causal source, each group oldest first.
///
/// Ties on `created_at` are broken by id, so the first element of a group is
/// the entry a duplicate correction keeps.
pub fn entries_by_source<'a, I>(entries: I) -> BTreeMap<CausalSource, Vec<&'a LedgerEntry>>
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    let mut groups: BTreeMap<CausalSource, Vec<&LedgerEntry>> = BTreeMap::new();
    for entry in entries.into_iter().filter(|e| !e.is_deleted()) {
        if let Some(source) = entry.source {
            groups.entry(source).or_default().push(entry);
        }
    }
    for group in groups.values_mut() {
        group.sort_by_key(|e| (e.created_at, e.id));
    }
    groups
}

/// Live unpaid entries with no causal source, in id order.
pub fn orphaned_entries<'a, I>(entries: I) -> Vec<&'a LedgerEntry>
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    let mut orphans: Vec<&LedgerEntry> = entries
        .into_iter()
        .filter(|e| counts(e) && e.is_orphan())
        .collect();
    orphans.sort_by_key(|e| e.id);
    orphans
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{AccountId, BalanceId, LedgerEntryId, Timestamp};

    pub(crate) fn entry(
        id: i64,
        source: Option<CausalSource>,
        issued: i64,
        holding: i64,
        created_at: i64,
    ) -> LedgerEntry {
        LedgerEntry {
            id: LedgerEntryId::new(id),
            account_id: AccountId::new(1),
            balance_id: BalanceId::new(1),
            source,
            issued_net: Cents(issued),
            holding_net: Cents(holding),
            currency: Currency::usd(),
            merchant_account_id: None,
            payout_id: None,
            created_at: Timestamp::from_micros(created_at),
            deleted_at: None,
        }
    }

    #[test]
    fn test_totals_skip_deleted_and_paid() {
        let mut deleted = entry(2, Some(CausalSource::purchase(2)), 300, 300, 1);
        deleted.deleted_at = Some(Timestamp::from_micros(5));
        let mut paid = entry(3, Some(CausalSource::purchase(3)), 700, 0, 2);
        paid.payout_id = Some(9);

        let entries = vec![
            entry(1, Some(CausalSource::purchase(1)), 1000, 400, 0),
            deleted,
            paid,
            entry(4, Some(CausalSource::refund(1)), -250, -100, 3),
        ];

        let totals = LedgerTotals::of(&entries);
        assert_eq!(totals.issued, Cents(750));
        assert_eq!(totals.holding, Cents(300));
        assert_eq!(totals.get(BalanceField::HoldingAmount), Cents(300));
        assert_eq!(LedgerTotals::of(Vec::<LedgerEntry>::new().iter()), LedgerTotals::default());
    }

    #[test]
    fn test_merchant_holding_filters_account_and_currency() {
        let mut a = entry(1, Some(CausalSource::purchase(1)), 0, 500, 0);
        a.merchant_account_id = Some("acct_1".to_string());
        let mut b = entry(2, Some(CausalSource::purchase(2)), 0, 200, 1);
        b.merchant_account_id = Some("acct_2".to_string());
        let mut c = entry(3, Some(CausalSource::purchase(3)), 0, 50, 2);
        c.merchant_account_id = Some("acct_1".to_string());
        c.currency = Currency::new("eur");

        let entries = vec![a, b, c];
        assert_eq!(
            merchant_holding(&entries, "acct_1", &Currency::usd()),
            Cents(500)
        );
    }

    #[test]
    fn test_entries_by_source_orders_oldest_first() {
        let source = CausalSource::purchase(42);
        let entries = vec![
            entry(7, Some(source), 1000, 1000, 5),
            entry(3, Some(source), 1000, 1000, 5),
            entry(9, Some(source), 1000, 1000, 1),
            entry(4, Some(CausalSource::purchase(43)), 10, 10, 0),
            entry(5, None, 10, 10, 0),
        ];

        let groups = entries_by_source(&entries);
        assert_eq!(groups.len(), 2);
        let ids: Vec<i64> = groups[&source].iter().map(|e| e.id.as_i64()).collect();
        assert_eq!(ids, vec![9, 3, 7]);

        let orphans = orphaned_entries(&entries);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, LedgerEntryId::new(5));
    }

    #[test]
    fn test_entries_by_source_includes_paid_entries() {
        let source = CausalSource::purchase(8);
        let mut paid = entry(1, Some(source), 500, 500, 0);
        paid.payout_id = Some(3);
        let mut deleted = entry(3, Some(source), 500, 500, 2);
        deleted.deleted_at = Some(Timestamp::from_micros(4));
        let entries = vec![paid, entry(2, Some(source), 500, 500, 1), deleted];

        let groups = entries_by_source(&entries);
        let ids: Vec<i64> = groups[&source].iter().map(|e| e.id.as_i64()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(LedgerTotals::of(&entries).issued, Cents(500));
    }
}
