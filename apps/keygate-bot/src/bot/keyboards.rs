use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup};

pub const BTN_BUY: &str = "💳 Buy VPN";
pub const BTN_MY_KEYS: &str = "🔐 My keys";
pub const BTN_TRIAL: &str = "🎁 Free trial";

pub fn main_menu() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new(BTN_BUY), KeyboardButton::new(BTN_MY_KEYS)],
        vec![KeyboardButton::new(BTN_TRIAL)],
    ])
    .resize_keyboard()
}

fn price_label(amount_minor: i64, currency: &str) -> String {
    format!("{}.{:02} {}", amount_minor / 100, amount_minor % 100, currency)
}

fn plan_label(months: i32, amount_minor: i64, currency: &str) -> String {
    let period = match months {
        1 => "1 month".to_string(),
        12 => "1 year".to_string(),
        m => format!("{} months", m),
    };
    format!("{} — {}", period, price_label(amount_minor, currency))
}

/// One button per offered period. `callback_prefix` distinguishes a new
/// purchase ("buy") from an extension ("ext_{entitlement_id}").
pub fn plans_keyboard(
    base_price_minor: i64,
    currency: &str,
    callback_prefix: &str,
) -> InlineKeyboardMarkup {
    let rows = [1, 6, 12]
        .into_iter()
        .map(|months: i32| {
            vec![InlineKeyboardButton::callback(
                plan_label(months, base_price_minor * months as i64, currency),
                format!("{}_{}", callback_prefix, months),
            )]
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}
