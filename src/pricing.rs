use catalog_types::supplier::Supplier;
use rust_decimal::Decimal;

/// Markup rules of one supplier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Markup {
    pub percent: Decimal,
    pub min_profit_enabled: bool,
    pub min_profit_amount: Decimal,
}

impl From<&Supplier> for Markup {
    fn from(s: &Supplier) -> Self {
        Self {
            percent: s.markup_percent,
            min_profit_enabled: s.min_profit_enabled,
            min_profit_amount: s.min_profit_amount,
        }
    }
}

impl Markup {
    pub fn percent(percent: Decimal) -> Self {
        Self {
            percent,
            min_profit_enabled: false,
            min_profit_amount: Decimal::ZERO,
        }
    }
}

/// Applies markup and the minimal profit floor, then rounds up to a multiple of 10
pub fn calculate_final_price(base: Decimal, markup: Markup) -> Decimal {
    let mut price = base * (Decimal::ONE + markup.percent / Decimal::ONE_HUNDRED);
    if markup.min_profit_enabled
        && markup.min_profit_amount > Decimal::ZERO
        && price - base < markup.min_profit_amount
    {
        price = base + markup.min_profit_amount;
    }
    round_up_to_ten(price)
}

pub fn round_up_to_ten(price: Decimal) -> Decimal {
    let ten = Decimal::TEN;
    (price / ten).ceil() * ten
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn markup_without_min_profit() {
        assert_eq!(
            dec!(1100),
            calculate_final_price(dec!(1000), Markup::percent(dec!(10)))
        );
    }

    #[test]
    fn min_profit_floor_applies() {
        let markup = Markup {
            percent: dec!(1),
            min_profit_enabled: true,
            min_profit_amount: dec!(500),
        };
        assert_eq!(dec!(1500), calculate_final_price(dec!(1000), markup));
    }

    #[test]
    fn min_profit_ignored_when_markup_is_enough() {
        let markup = Markup {
            percent: dec!(50),
            min_profit_enabled: true,
            min_profit_amount: dec!(100),
        };
        assert_eq!(dec!(1500), calculate_final_price(dec!(1000), markup));
    }

    #[test]
    fn rounds_up_not_to_nearest() {
        assert_eq!(dec!(110), round_up_to_ten(dec!(100.01)));
        assert_eq!(dec!(100), round_up_to_ten(dec!(100)));
        assert_eq!(
            dec!(130),
            calculate_final_price(dec!(121), Markup::percent(dec!(0)))
        );
    }
}
