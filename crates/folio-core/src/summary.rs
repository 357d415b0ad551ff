//! Monthly income/expense rollups over persisted transactions.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::calendar::month_start;
use crate::{Category, CategoryId, MonthlyCategorySummary, Transaction, INVESTMENTS, TRANSFER};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthSummary {
    pub income_cents: i64,
    pub expenses_cents: i64,
    pub invested_cents: i64,
    pub spent_by_category: BTreeMap<String, i64>,
}

/// Income is every inflow; outflows count as invested when categorized as
/// investments, as expenses when the category is an expense category or
/// missing. Transfers are ignored on both sides.
pub fn summarize_month(transactions: &[Transaction], categories: &[Category]) -> MonthSummary {
    let by_id = categories
        .iter()
        .map(|category| (category.id, category))
        .collect::<HashMap<CategoryId, &Category>>();
    let id_named = |name: &str| {
        categories
            .iter()
            .find(|category| category.name == name)
            .map(|category| category.id)
    };
    let transfer_id = id_named(TRANSFER);
    let investments_id = id_named(INVESTMENTS);

    let mut summary = MonthSummary::default();
    for txn in transactions {
        if txn.category_id.is_some() && txn.category_id == transfer_id {
            continue;
        }
        if txn.amount_cents < 0 {
            summary.income_cents += -txn.amount_cents;
            continue;
        }
        match txn.category_id.and_then(|id| by_id.get(&id)) {
            Some(category) if Some(category.id) == investments_id => {
                summary.invested_cents += txn.amount_cents;
            }
            Some(category) if category.expense => {
                summary.expenses_cents += txn.amount_cents;
                *summary
                    .spent_by_category
                    .entry(category.name.clone())
                    .or_default() += txn.amount_cents;
            }
            Some(_) => {}
            None => summary.expenses_cents += txn.amount_cents,
        }
    }
    summary
}

/// Groups transactions by (month, category) for retention rollups.
pub fn category_totals(transactions: &[Transaction]) -> Vec<MonthlyCategorySummary> {
    let mut totals = BTreeMap::<_, (i64, i64)>::new();
    for txn in transactions {
        let entry = totals
            .entry((month_start(txn.date), txn.category_id))
            .or_default();
        entry.0 += txn.amount_cents;
        entry.1 += 1;
    }
    totals
        .into_iter()
        .map(|((month, category_id), (total_cents, transaction_count))| MonthlyCategorySummary {
            month,
            category_id,
            total_cents,
            transaction_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn txn(id: &str, day: u32, amount_cents: i64, category_id: Option<CategoryId>) -> Transaction {
        Transaction {
            external_id: id.to_string(),
            account_id: "acc".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 3, day).expect("date"),
            amount_cents,
            name: id.to_string(),
            merchant_name: None,
            category_id,
            pending: false,
            updated_at: Utc::now(),
        }
    }

    fn categories() -> Vec<Category> {
        vec![
            Category { id: 1, name: "Uncategorized".into(), provider_alias: None, expense: true },
            Category { id: 2, name: "Transfer".into(), provider_alias: Some("Transfer".into()), expense: false },
            Category { id: 3, name: "Investments".into(), provider_alias: None, expense: false },
            Category { id: 4, name: "Groceries".into(), provider_alias: None, expense: true },
            Category { id: 5, name: "Income".into(), provider_alias: None, expense: false },
        ]
    }

    #[test]
    fn summary_splits_income_expenses_and_investments() {
        let txns = vec![
            txn("paycheck", 1, -500_000, Some(5)),
            txn("groceries", 2, 12_000, Some(4)),
            txn("more-groceries", 3, 3_000, Some(4)),
            txn("brokerage", 4, 100_000, Some(3)),
            txn("card-payment", 5, 40_000, Some(2)),
            txn("refund-transfer", 6, -40_000, Some(2)),
            txn("mystery", 7, 999, None),
            txn("interest-fee-reversal", 8, 1_500, Some(5)),
        ];
        let summary = summarize_month(&txns, &categories());
        assert_eq!(summary.income_cents, 500_000);
        assert_eq!(summary.expenses_cents, 15_999);
        assert_eq!(summary.invested_cents, 100_000);
        assert_eq!(summary.spent_by_category.get("Groceries"), Some(&15_000));
        assert!(!summary.spent_by_category.contains_key("Income"));
    }

    #[test]
    fn category_totals_group_by_month_and_category() {
        let mut april = txn("april", 1, 700, Some(4));
        april.date = NaiveDate::from_ymd_opt(2026, 4, 2).expect("date");
        let txns = vec![
            txn("a", 1, 100, Some(4)),
            txn("b", 9, 250, Some(4)),
            txn("c", 9, 50, None),
            april,
        ];
        let totals = category_totals(&txns);
        assert_eq!(totals.len(), 3);
        let march_groceries = totals
            .iter()
            .find(|t| t.category_id == Some(4) && t.month.to_string() == "2026-03-01")
            .expect("march groceries");
        assert_eq!(march_groceries.total_cents, 350);
        assert_eq!(march_groceries.transaction_count, 2);
    }
}
