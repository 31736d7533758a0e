use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pharmastock_core::{DomainError, DomainResult, Entity, ProductId, SaleId, UserId};

/// One line of an incoming sale request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRequestLine {
    pub product_id: ProductId,
    pub quantity: i64,
    /// Price override; the product's selling price applies when absent.
    #[serde(default)]
    pub unit_price: Option<i64>,
}

/// A request line after duplicates of the same product were folded together.
///
/// `index` is the position of the first request line for the product, used
/// when an error has to point back at the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedLine {
    pub index: usize,
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: Option<i64>,
}

impl MergedLine {
    /// Fix the price charged for this line.
    pub fn priced(self, selling_price: i64) -> SaleLineItem {
        SaleLineItem {
            product_id: self.product_id,
            quantity: self.quantity,
            price_at_sale: self.unit_price.unwrap_or(selling_price),
        }
    }
}

/// Validate request lines and fold duplicates per product, keeping first-seen order.
pub fn merge_lines(lines: &[SaleRequestLine]) -> DomainResult<Vec<MergedLine>> {
    if lines.is_empty() {
        return Err(DomainError::validation("lines", "a sale needs at least one line"));
    }

    let mut merged: Vec<MergedLine> = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        if line.quantity <= 0 {
            return Err(DomainError::validation("quantity", "must be positive").at_line(index));
        }
        if line.unit_price.is_some_and(|p| p < 0) {
            return Err(DomainError::validation("unit_price", "cannot be negative").at_line(index));
        }

        match merged.iter_mut().find(|m| m.product_id == line.product_id) {
            Some(existing) => {
                if existing.unit_price != line.unit_price {
                    return Err(DomainError::validation(
                        "unit_price",
                        format!(
                            "product {} appears on line {} with a different price",
                            line.product_id, existing.index
                        ),
                    )
                    .at_line(index));
                }
                existing.quantity = existing
                    .quantity
                    .checked_add(line.quantity)
                    .ok_or_else(|| DomainError::validation("quantity", "too large").at_line(index))?;
            }
            None => merged.push(MergedLine {
                index,
                product_id: line.product_id,
                quantity: line.quantity,
                unit_price: line.unit_price,
            }),
        }
    }
    Ok(merged)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Transfer => "transfer",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "transfer" => Ok(PaymentMethod::Transfer),
            other => Err(DomainError::validation(
                "payment_method",
                format!("unknown payment method '{other}'"),
            )),
        }
    }
}

/// A sold product line with the price that was actually charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleLineItem {
    pub product_id: ProductId,
    pub quantity: i64,
    pub price_at_sale: i64,
}

impl SaleLineItem {
    pub fn line_total(&self) -> Option<i64> {
        self.quantity.checked_mul(self.price_at_sale)
    }
}

/// A completed point-of-sale transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleTransaction {
    id: SaleId,
    cashier_id: UserId,
    payment_method: PaymentMethod,
    total_price: i64,
    amount_paid: i64,
    change_due: i64,
    lines: Vec<SaleLineItem>,
    created_at: DateTime<Utc>,
}

impl Entity for SaleTransaction {
    type Id = SaleId;

    fn id(&self) -> SaleId {
        self.id
    }
}

impl SaleTransaction {
    /// Build the sale record. The customer must pay at least the total.
    pub fn record(
        id: SaleId,
        cashier_id: UserId,
        payment_method: PaymentMethod,
        amount_paid: i64,
        lines: Vec<SaleLineItem>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if lines.is_empty() {
            return Err(DomainError::validation("lines", "a sale needs at least one line"));
        }

        let mut total_price: i64 = 0;
        for (index, line) in lines.iter().enumerate() {
            total_price = line
                .line_total()
                .and_then(|t| total_price.checked_add(t))
                .ok_or_else(|| DomainError::validation("quantity", "sale total overflows").at_line(index))?;
        }

        if amount_paid < total_price {
            return Err(DomainError::validation(
                "amount_paid",
                format!("paid {amount_paid} is less than the total {total_price}"),
            ));
        }

        Ok(Self {
            id,
            cashier_id,
            payment_method,
            total_price,
            amount_paid,
            change_due: amount_paid - total_price,
            lines,
            created_at: now,
        })
    }

    /// Rebuild a sale loaded from storage.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: SaleId,
        cashier_id: UserId,
        payment_method: PaymentMethod,
        total_price: i64,
        amount_paid: i64,
        change_due: i64,
        lines: Vec<SaleLineItem>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            cashier_id,
            payment_method,
            total_price,
            amount_paid,
            change_due,
            lines,
            created_at,
        }
    }

    pub fn cashier_id(&self) -> UserId {
        self.cashier_id
    }

    pub fn payment_method(&self) -> PaymentMethod {
        self.payment_method
    }

    pub fn total_price(&self) -> i64 {
        self.total_price
    }

    pub fn amount_paid(&self) -> i64 {
        self.amount_paid
    }

    pub fn change_due(&self) -> i64 {
        self.change_due
    }

    pub fn lines(&self) -> &[SaleLineItem] {
        &self.lines
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn pid(n: u128) -> ProductId {
        ProductId::from_uuid(Uuid::from_u128(n))
    }

    fn line(product: u128, quantity: i64, unit_price: Option<i64>) -> SaleRequestLine {
        SaleRequestLine {
            product_id: pid(product),
            quantity,
            unit_price,
        }
    }

    #[test]
    fn duplicate_products_are_folded_in_first_seen_order() {
        let merged = merge_lines(&[line(2, 3, None), line(1, 1, Some(50)), line(2, 4, None)]).unwrap();
        assert_eq!(
            merged,
            vec![
                MergedLine { index: 0, product_id: pid(2), quantity: 7, unit_price: None },
                MergedLine { index: 1, product_id: pid(1), quantity: 1, unit_price: Some(50) },
            ]
        );
    }

    #[test]
    fn conflicting_prices_for_one_product_are_rejected() {
        let err = merge_lines(&[line(1, 1, Some(10)), line(1, 1, Some(12))]).unwrap_err();
        assert!(matches!(err, DomainError::Validation { ref field, .. } if field == "lines[1].unit_price"));
    }

    #[test]
    fn bad_lines_point_at_their_index() {
        assert!(matches!(
            merge_lines(&[line(1, 2, None), line(2, 0, None)]),
            Err(DomainError::Validation { ref field, .. }) if field == "lines[1].quantity"
        ));
        assert!(matches!(
            merge_lines(&[line(1, 2, Some(-1))]),
            Err(DomainError::Validation { ref field, .. }) if field == "lines[0].unit_price"
        ));
        assert!(merge_lines(&[]).is_err());
    }

    #[test]
    fn price_override_wins_over_catalog_price() {
        let merged = merge_lines(&[line(1, 2, Some(90)), line(2, 1, None)]).unwrap();
        assert_eq!(merged[0].priced(100).price_at_sale, 90);
        assert_eq!(merged[1].priced(100).price_at_sale, 100);
    }

    #[test]
    fn record_computes_total_and_change() {
        let items = vec![
            SaleLineItem { product_id: pid(1), quantity: 2, price_at_sale: 1500 },
            SaleLineItem { product_id: pid(2), quantity: 1, price_at_sale: 700 },
        ];
        let sale = SaleTransaction::record(
            SaleId::new(),
            UserId::new(),
            PaymentMethod::Cash,
            5000,
            items,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(sale.total_price(), 3700);
        assert_eq!(sale.change_due(), 1300);
    }

    #[test]
    fn underpayment_is_rejected() {
        let items = vec![SaleLineItem { product_id: pid(1), quantity: 2, price_at_sale: 1500 }];
        let err = SaleTransaction::record(
            SaleId::new(),
            UserId::new(),
            PaymentMethod::Card,
            2999,
            items,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation { ref field, .. } if field == "amount_paid"));
    }

    #[test]
    fn payment_method_parses_its_own_labels() {
        for m in [PaymentMethod::Cash, PaymentMethod::Card, PaymentMethod::Transfer] {
            assert_eq!(PaymentMethod::parse(m.as_str()).unwrap(), m);
        }
        assert!(PaymentMethod::parse("cheque").is_err());
    }
}
