use teloxide::{
    dptree,
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode},
};
use tracing::{error, info};

use keygate_db::models::Entitlement;

use crate::services::ReconcileError;
use crate::AppState;

pub mod keyboards;
pub mod utils;

use keyboards::{main_menu, plans_keyboard, BTN_BUY, BTN_MY_KEYS, BTN_TRIAL};
use utils::{escape_md, escape_md_code};

fn entitlement_text(header: &str, e: &Entitlement) -> String {
    format!(
        "{}\n\n🔑 Access key:\n`{}`\n\n📅 Valid until: {}",
        header,
        escape_md_code(&e.access_url),
        escape_md(&e.expires_at.format("%Y-%m-%d %H:%M UTC").to_string()),
    )
}

async fn send_payment_link(
    bot: &Bot,
    chat_id: ChatId,
    redirect_url: &str,
) -> Result<(), teloxide::RequestError> {
    let text = "💳 *Payment created*\n\nComplete it within 15 minutes\\. \
                Your key arrives here right after the payment\\.";
    match redirect_url.parse() {
        Ok(url) => {
            let kb = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::url(
                "💳 Pay now",
                url,
            )]]);
            bot.send_message(chat_id, text)
                .parse_mode(ParseMode::MarkdownV2)
                .reply_markup(kb)
                .await?;
        }
        Err(_) => {
            bot.send_message(
                chat_id,
                format!("{}\n\n{}", text, escape_md(redirect_url)),
            )
            .parse_mode(ParseMode::MarkdownV2)
            .await?;
        }
    }
    Ok(())
}

async fn handle_buy(
    bot: &Bot,
    chat_id: ChatId,
    state: &AppState,
    tg_id: i64,
    months: i32,
    extend_target: Option<i64>,
) -> Result<(), teloxide::RequestError> {
    match state.engine.request_payment(tg_id, months, extend_target).await {
        Ok(redirect_url) => send_payment_link(bot, chat_id, &redirect_url).await?,
        Err(e) => {
            error!("Payment request by user {} failed: {:#}", tg_id, anyhow::anyhow!(e));
            let _ = bot
                .send_message(
                    chat_id,
                    "❌ Could not create the payment\\. Please try again later\\.",
                )
                .parse_mode(ParseMode::MarkdownV2)
                .await;
        }
    }
    Ok(())
}

pub async fn run_bot(bot: Bot, state: AppState) {
    info!("Starting bot dispatcher");

    let message_handler = Update::filter_message().endpoint(
        |bot: Bot, msg: Message, state: AppState| async move {
            let Some(from) = msg.from.as_ref() else {
                return Ok(());
            };
            let tg_id = from.id.0 as i64;
            let Some(text) = msg.text() else {
                return Ok(());
            };

            // Keep the profile fresh on every contact.
            if let Err(e) = state
                .engine
                .register_user(
                    tg_id,
                    from.username.as_deref(),
                    Some(&from.first_name),
                    from.last_name.as_deref(),
                )
                .await
            {
                error!("Failed to upsert user {}: {:#}", tg_id, e);
                return Ok(());
            }

            if text.starts_with("/start") {
                let welcome = format!(
                    "👋 *Hello, {}\\!*\n\n\
                     This bot sells VPN access keys\\.\n\
                     Pick an option from the menu below\\.",
                    escape_md(&from.first_name)
                );
                let _ = bot
                    .send_message(msg.chat.id, welcome)
                    .parse_mode(ParseMode::MarkdownV2)
                    .reply_markup(main_menu())
                    .await;
                return Ok(());
            }

            match text {
                BTN_BUY => {
                    let kb = plans_keyboard(
                        state.settings.base_price_minor,
                        &state.settings.currency,
                        "buy",
                    );
                    let _ = bot
                        .send_message(msg.chat.id, "💳 *Choose a plan:*")
                        .parse_mode(ParseMode::MarkdownV2)
                        .reply_markup(kb)
                        .await;
                }

                BTN_TRIAL => match state.engine.request_trial(tg_id).await {
                    Ok(entitlement) => {
                        let _ = bot
                            .send_message(
                                msg.chat.id,
                                entitlement_text("🎁 *Your free trial is ready\\!*", &entitlement),
                            )
                            .parse_mode(ParseMode::MarkdownV2)
                            .await;
                    }
                    Err(ReconcileError::TrialAlreadyUsed) => {
                        let kb = plans_keyboard(
                            state.settings.base_price_minor,
                            &state.settings.currency,
                            "buy",
                        );
                        let _ = bot
                            .send_message(
                                msg.chat.id,
                                "🎁 You already used your free trial\\. \
                                 Pick a plan to keep going:",
                            )
                            .parse_mode(ParseMode::MarkdownV2)
                            .reply_markup(kb)
                            .await;
                    }
                    Err(e) => {
                        error!("Trial request by user {} failed: {:#}", tg_id, anyhow::anyhow!(e));
                        let _ = bot
                            .send_message(
                                msg.chat.id,
                                "❌ Could not create a trial key right now\\. \
                                 Please try again later\\.",
                            )
                            .parse_mode(ParseMode::MarkdownV2)
                            .await;
                    }
                },

                BTN_MY_KEYS => match state.engine.list_active_entitlements(tg_id).await {
                    Ok(active) if active.is_empty() => {
                        let _ = bot
                            .send_message(
                                msg.chat.id,
                                "🔐 You have no active keys yet\\. \
                                 Grab the free trial or buy a plan\\!",
                            )
                            .parse_mode(ParseMode::MarkdownV2)
                            .await;
                    }
                    Ok(active) => {
                        for entitlement in active {
                            let kb = InlineKeyboardMarkup::new(vec![vec![
                                InlineKeyboardButton::callback(
                                    "⏳ Extend",
                                    format!("extendmenu_{}", entitlement.id),
                                ),
                            ]]);
                            let _ = bot
                                .send_message(
                                    msg.chat.id,
                                    entitlement_text("🔐 *Active key*", &entitlement),
                                )
                                .parse_mode(ParseMode::MarkdownV2)
                                .reply_markup(kb)
                                .await;
                        }
                    }
                    Err(e) => {
                        error!("Failed to list keys for user {}: {:#}", tg_id, e);
                        let _ = bot
                            .send_message(msg.chat.id, "❌ Could not load your keys\\.")
                            .parse_mode(ParseMode::MarkdownV2)
                            .await;
                    }
                },

                _ => {
                    let _ = bot
                        .send_message(msg.chat.id, "Use the menu below 👇")
                        .reply_markup(main_menu())
                        .await;
                }
            }
            Ok::<_, teloxide::RequestError>(())
        },
    );

    let callback_handler = Update::filter_callback_query().endpoint(
        |bot: Bot, q: CallbackQuery, state: AppState| async move {
            let tg_id = q.from.id.0 as i64;
            let Some(data) = q.data.clone() else {
                let _ = bot.answer_callback_query(q.id).await;
                return Ok(());
            };
            let Some(chat_id) = q.message.as_ref().map(|m| m.chat().id) else {
                let _ = bot.answer_callback_query(q.id).await;
                return Ok(());
            };

            match data.as_str() {
                buy if buy.starts_with("buy_") => {
                    let months = buy.strip_prefix("buy_").unwrap_or("0").parse::<i32>().unwrap_or(0);
                    let _ = bot.answer_callback_query(q.id).await;
                    if (1..=12).contains(&months) {
                        handle_buy(&bot, chat_id, &state, tg_id, months, None).await?;
                    }
                }

                menu if menu.starts_with("extendmenu_") => {
                    let entitlement_id = menu
                        .strip_prefix("extendmenu_")
                        .unwrap_or("0")
                        .parse::<i64>()
                        .unwrap_or(0);
                    let _ = bot.answer_callback_query(q.id).await;
                    let kb = plans_keyboard(
                        state.settings.base_price_minor,
                        &state.settings.currency,
                        &format!("ext_{}", entitlement_id),
                    );
                    let _ = bot
                        .send_message(chat_id, "⏳ *Extend for:*")
                        .parse_mode(ParseMode::MarkdownV2)
                        .reply_markup(kb)
                        .await;
                }

                ext if ext.starts_with("ext_") => {
                    // ext_{entitlement_id}_{months}
                    let mut parts = ext.strip_prefix("ext_").unwrap_or("").splitn(2, '_');
                    let entitlement_id = parts.next().and_then(|s| s.parse::<i64>().ok());
                    let months = parts.next().and_then(|s| s.parse::<i32>().ok());
                    let _ = bot.answer_callback_query(q.id).await;
                    if let (Some(entitlement_id), Some(months)) = (entitlement_id, months) {
                        if (1..=12).contains(&months) {
                            handle_buy(&bot, chat_id, &state, tg_id, months, Some(entitlement_id))
                                .await?;
                        }
                    }
                }

                _ => {
                    let _ = bot.answer_callback_query(q.id).await;
                }
            }
            Ok::<_, teloxide::RequestError>(())
        },
    );

    let mut dispatcher = Dispatcher::builder(
        bot,
        dptree::entry().branch(message_handler).branch(callback_handler),
    )
    .dependencies(dptree::deps![state])
    .enable_ctrlc_handler()
    .build();

    dispatcher.dispatch().await;
}
