//! Command, message, and callback handlers.
//!
//! Chat turns are spawned onto the state's task tracker so the dispatcher
//! stays free while the model call is in flight. Nothing in here is allowed
//! to kill the dispatcher: handler errors end at this layer.

use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{
    ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, Message, ParseMode, User,
};
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};

use crate::BotState;
use crate::sanitize::FormatMode;
use crate::storage::{HISTORY_DEFAULT, HISTORY_MAX};

/// Telegram caps messages at ~4096 chars; stay under it with some margin.
pub const REPLY_CHUNK_LIMIT: usize = 4000;

/// Pause between consecutive chunks of one reply.
const CHUNK_PAUSE: Duration = Duration::from_millis(300);

/// Characters of a stored response shown in /history previews.
const HISTORY_PREVIEW_CHARS: usize = 500;

const ACK_TEXT: &str = "✅ Принял твои слова. Обдумываю...";
const APOLOGY_TEXT: &str =
    "❌ Произошла ошибка при обработке вашего запроса. Пожалуйста, попробуйте еще раз.";
const COMMENT_THANKS: &str = "Спасибо за ваш комментарий! Он поможет улучшить работу бота.";
const ADMIN_DENIED: &str = "❌ У вас нет доступа к административной панели.";

const DIARY_HINT: &str = "💡 Кстати, вы можете использовать этот чат как дневник для \
отслеживания своих достижений. Просто начните сообщение со слов «Сегодня я...» и опишите \
свои действия и их результат.";

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
pub enum Command {
    #[command(description = "начать работу с ботом")]
    Start,
    #[command(description = "показать справку")]
    Help,
    #[command(description = "получить случайное задание")]
    Task,
    #[command(description = "стать получателем обратной связи")]
    Setadmin,
    #[command(description = "оценить работу бота")]
    Feedback,
    #[command(description = "история взаимодействий, например /history 10")]
    History(String),
    #[command(description = "панель администратора")]
    Admin,
}

/// `/history` takes an optional count; anything unparsable means the
/// default, and the cap is enforced here as well as in storage.
fn history_limit(arg: &str) -> usize {
    let trimmed = arg.trim();
    let n = if trimmed.is_empty() {
        HISTORY_DEFAULT
    } else {
        trimmed.parse().unwrap_or(HISTORY_DEFAULT)
    };
    n.min(HISTORY_MAX)
}

// ==================== keyboards ====================

fn task_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback("🔄 Другое задание", "new_task")],
        vec![InlineKeyboardButton::callback("✅ Задание выполнено", "task_completed")],
    ])
}

fn onboarding_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "Да, я хочу получать фидбек",
        "set_admin",
    )]])
}

fn feedback_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("👍 Хорошо", "feedback_good"),
        InlineKeyboardButton::callback("👎 Плохо", "feedback_bad"),
    ]])
}

fn reason_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("Неточный ответ", "reason_inaccurate"),
            InlineKeyboardButton::callback("Непонятно", "reason_unclear"),
        ],
        vec![
            InlineKeyboardButton::callback("Слишком кратко", "reason_short"),
            InlineKeyboardButton::callback("Слишком длинно", "reason_long"),
        ],
        vec![InlineKeyboardButton::callback("Другое", "reason_other")],
    ])
}

fn comment_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "📝 Добавить комментарий",
        "add_comment",
    )]])
}

fn admin_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("📊 Статистика", "admin_stats"),
            InlineKeyboardButton::callback("👥 Пользователи", "admin_users"),
        ],
        vec![
            InlineKeyboardButton::callback("📝 Логи", "admin_logs"),
            InlineKeyboardButton::callback("🛠 Настройки", "admin_settings"),
        ],
    ])
}

// ==================== commands ====================

pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: Arc<BotState>,
) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };

    match cmd {
        Command::Start => {
            if state.admin.get().is_none() {
                bot.send_message(
                    msg.chat.id,
                    "Привет! Я бот, который поможет сократить виртуальное общение \
                     в пользу живого.\nПросто напишите мне, и я отвечу!\n\n\
                     Хотите ли вы получать фидбек от пользователей?",
                )
                .reply_markup(onboarding_keyboard())
                .await?;
            } else {
                bot.send_message(
                    msg.chat.id,
                    format!(
                        "Привет! Я бот, который поможет сократить виртуальное общение \
                         в пользу живого.\nПросто напишите мне, и я отвечу!\n\n\
                         Если хотите оставить отзыв о работе бота, используйте команду \
                         /feedback\n\n{DIARY_HINT}"
                    ),
                )
                .await?;
            }
        }
        Command::Help => {
            bot.send_message(
                msg.chat.id,
                format!(
                    "🤖 Использование бота:\n\n\
                     1. Просто отправьте сообщение, и я отвечу вам.\n\
                     2. /start — начало работы\n\
                     3. /help — эта справка\n\
                     4. /task — случайное задание\n\
                     5. /feedback — отзыв о работе бота\n\
                     6. /history [N] — последние взаимодействия\n\n{DIARY_HINT}"
                ),
            )
            .await?;
        }
        Command::Task => {
            let task = state.tasks.random_task();
            bot.send_message(msg.chat.id, task_text(&task))
                .reply_markup(task_keyboard())
                .await?;
        }
        Command::Setadmin => {
            state.admin.set(user.id);
            info!("Admin set to {} via /setadmin", user.id);
            bot.send_message(
                msg.chat.id,
                format!("✅ Вы установлены как администратор. Ваш ID: {}", user.id),
            )
            .await?;
        }
        Command::Feedback => {
            bot.send_message(msg.chat.id, "Оцените работу бота:")
                .reply_markup(feedback_keyboard())
                .await?;
        }
        Command::History(arg) => {
            let rows = state.log.history(user.id.0 as i64, history_limit(&arg));
            if rows.is_empty() {
                bot.send_message(msg.chat.id, "У вас пока нет истории взаимодействий.")
                    .await?;
            } else {
                bot.send_message(msg.chat.id, format_history(&rows)).await?;
            }
        }
        Command::Admin => {
            if !state.admin.is_admin(user.id) {
                bot.send_message(msg.chat.id, ADMIN_DENIED).await?;
                return Ok(());
            }
            match state.log.stats() {
                Some(stats) => {
                    bot.send_message(msg.chat.id, format_stats(&stats))
                        .reply_markup(admin_keyboard())
                        .await?;
                }
                None => {
                    bot.send_message(msg.chat.id, "❌ Не удалось получить статистику.")
                        .await?;
                }
            }
        }
    }

    Ok(())
}

fn task_text(task: &str) -> String {
    format!(
        "🎯 Ваше задание:\n\n{task}\n\nВыполнение таких заданий поможет вам сократить \
         виртуальное общение и развить навыки реального общения."
    )
}

fn format_history(rows: &[crate::storage::InteractionRow]) -> String {
    let mut text = String::from("📜 Ваша история взаимодействий:\n\n");
    for (i, row) in rows.iter().enumerate() {
        text.push_str(&format!("Взаимодействие {}:\n", i + 1));
        text.push_str(&format!("📅 {}\n", row.timestamp));
        text.push_str(&format!("👤 Вы: {}\n", row.user_message));
        let response = row.bot_response.as_deref().unwrap_or("—");
        text.push_str(&format!("🤖 Бот: {}\n\n", preview(response, HISTORY_PREVIEW_CHARS)));
    }
    text
}

fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

fn format_stats(stats: &crate::storage::Stats) -> String {
    let mut text = format!(
        "🤖 Административная панель бота\n\n\
         📈 Общая статистика:\n\
         👥 Всего пользователей: {}\n\
         💬 Всего взаимодействий: {}\n\
         🕒 Взаимодействий за 24 часа: {}\n\n\
         🏆 Топ-5 активных пользователей:\n",
        stats.distinct_users, stats.total_interactions, stats.last_24h
    );
    for (i, user) in stats.top_users.iter().enumerate() {
        let name = user.username.as_deref().unwrap_or("Без имени");
        text.push_str(&format!(
            "{}. {} (ID: {}): {} взаимодействий\n",
            i + 1,
            name,
            user.user_id,
            user.count
        ));
    }
    text
}

// ==================== free text ====================

pub async fn handle_text(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    let Some(text) = msg.text().map(str::to_string) else {
        return Ok(());
    };

    // Unrecognized commands fall through to this branch; ignore them
    // instead of relaying them to the model.
    if text.starts_with('/') {
        return Ok(());
    }

    // A pending feedback session claims this message as the comment.
    if state.sessions.take(user.id).is_some() {
        bot.send_message(msg.chat.id, COMMENT_THANKS).await?;
        notify_admin(
            &bot,
            &state,
            format!(
                "💬 Новый комментарий от пользователя!\n\n\
                 👤 Пользователь: {} (ID: {})\n\
                 📝 Комментарий: {}",
                display_name(&user),
                user.id,
                text
            ),
        )
        .await;
        return Ok(());
    }

    let chat_id = msg.chat.id;
    info!("Chat turn from {} ({}) in {}", display_name(&user), user.id, chat_id);

    let ack = bot.send_message(chat_id, ACK_TEXT).await?;
    bot.send_chat_action(chat_id, ChatAction::Typing).await.ok();

    // The turn runs detached but tracked; the dispatcher moves on.
    let turn_bot = bot.clone();
    let turn_state = state.clone();
    state.turns.spawn(async move {
        let ack_id = ack.id;
        if let Err(e) =
            process_chat_turn(&turn_bot, &turn_state, chat_id, &user, ack_id, &text).await
        {
            warn!("Chat turn failed: {e}");
            turn_bot.send_message(chat_id, APOLOGY_TEXT).await.ok();
        }
    });

    Ok(())
}

async fn process_chat_turn(
    bot: &Bot,
    state: &BotState,
    chat_id: ChatId,
    user: &User,
    ack_id: teloxide::types::MessageId,
    text: &str,
) -> ResponseResult<()> {
    let reply = state.model.complete(text).await;

    state
        .log
        .record(user.id.0 as i64, user.username.as_deref(), text, Some(reply.as_str()));

    // The acknowledgment may already be gone; that is fine.
    if let Err(e) = bot.delete_message(chat_id, ack_id).await {
        warn!("Failed to delete acknowledgment: {e}");
    }

    deliver_reply(bot, chat_id, &reply, state.model.mode()).await
}

/// Send a reply in ≤`REPLY_CHUNK_LIMIT`-char pieces with a short pause
/// between them. Multi-part replies get a `Часть i/n` prefix.
async fn deliver_reply(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    mode: FormatMode,
) -> ResponseResult<()> {
    let chunks = chunk_text(text, REPLY_CHUNK_LIMIT);
    let total = chunks.len();
    for (i, chunk) in chunks.iter().enumerate() {
        let body = if total > 1 {
            format!("Часть {}/{}:\n\n{}", i + 1, total, chunk)
        } else {
            chunk.clone()
        };
        send_formatted(bot, chat_id, &body, mode).await?;
        if i + 1 < total {
            tokio::time::sleep(CHUNK_PAUSE).await;
        }
    }
    Ok(())
}

/// In escape mode the text is MarkdownV2; if Telegram still rejects the
/// markup, resend as plain text rather than losing the reply.
async fn send_formatted(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    mode: FormatMode,
) -> ResponseResult<()> {
    match mode {
        FormatMode::Strip => {
            bot.send_message(chat_id, text).await?;
        }
        FormatMode::Escape => {
            if let Err(e) = bot
                .send_message(chat_id, text)
                .parse_mode(ParseMode::MarkdownV2)
                .await
            {
                warn!("MarkdownV2 send failed, resending plain: {e}");
                bot.send_message(chat_id, text).await?;
            }
        }
    }
    Ok(())
}

fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        current.push(c);
        count += 1;
        if count == max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn display_name(user: &User) -> String {
    user.username
        .clone()
        .unwrap_or_else(|| "Без имени".to_string())
}

/// Feedback delivery is best effort: an unreachable admin is logged and
/// forgotten, never retried.
async fn notify_admin(bot: &Bot, state: &BotState, text: String) {
    let Some(admin_id) = state.admin.get() else {
        return;
    };
    if let Err(e) = bot.send_message(ChatId(admin_id.0 as i64), text).await {
        warn!("Failed to notify admin: {e}");
    }
}

// ==================== callbacks ====================

pub async fn handle_callback(bot: Bot, q: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    // Clear the loading indicator right away.
    bot.answer_callback_query(q.id.clone()).await.ok();

    let Some(data) = q.data.clone() else {
        return Ok(());
    };
    let user = q.from.clone();
    let anchor = q.message.as_ref().and_then(|m| m.regular_message()).cloned();

    match data.as_str() {
        "new_task" => {
            let task = state.tasks.random_task();
            respond(&bot, anchor.as_ref(), &user, &task_text(&task), Some(task_keyboard())).await?;
        }
        "task_completed" => {
            state.log.record(
                user.id.0 as i64,
                user.username.as_deref(),
                "Задание выполнено",
                Some("Пользователь отметил задание как выполненное"),
            );
            respond(
                &bot,
                anchor.as_ref(),
                &user,
                "🎉 Отлично! Задание выполнено!\n\nВы делаете важные шаги к сокращению \
                 виртуального общения в пользу живого! Продолжайте в том же духе!\n\n\
                 Хотите получить новое задание? Используйте команду /task",
                None,
            )
            .await?;
        }
        "set_admin" => {
            state.admin.set(user.id);
            info!("Admin set to {} via onboarding button", user.id);
            respond(
                &bot,
                anchor.as_ref(),
                &user,
                "✅ Вы настроены как админ для получения обратной связи.\n\n\
                 Теперь вы будете получать уведомления об отзывах пользователей.",
                None,
            )
            .await?;
        }
        "feedback_good" => {
            respond(
                &bot,
                anchor.as_ref(),
                &user,
                "Спасибо за положительный отзыв!",
                Some(comment_keyboard()),
            )
            .await?;
            notify_admin(
                &bot,
                &state,
                format!(
                    "📊 Новый положительный отзыв!\n\n👤 Пользователь: {} (ID: {})",
                    display_name(&user),
                    user.id
                ),
            )
            .await;
        }
        "feedback_bad" => {
            respond(
                &bot,
                anchor.as_ref(),
                &user,
                "Что именно вам не понравилось?",
                Some(reason_keyboard()),
            )
            .await?;
        }
        "add_comment" => {
            let anchor_id = anchor.as_ref().map(|m| m.id.0 as i64);
            state.sessions.begin(user.id, anchor_id);
            respond(
                &bot,
                anchor.as_ref(),
                &user,
                "Пожалуйста, напишите ваш комментарий к ответу. Ваш отзыв важен для \
                 улучшения работы бота.",
                None,
            )
            .await?;
        }
        _ if data.starts_with("reason_") => {
            let reason = feedback_reason(&data);
            respond(
                &bot,
                anchor.as_ref(),
                &user,
                &format!("Спасибо за ваш отзыв! Причина: {reason}"),
                Some(comment_keyboard()),
            )
            .await?;
            notify_admin(
                &bot,
                &state,
                format!(
                    "⚠️ Новый отрицательный отзыв!\n\n\
                     👤 Пользователь: {} (ID: {})\n\
                     📌 Причина: {}",
                    display_name(&user),
                    user.id,
                    reason
                ),
            )
            .await;
        }
        _ if data.starts_with("admin_") => {
            if !state.admin.is_admin(user.id) {
                respond(&bot, anchor.as_ref(), &user, ADMIN_DENIED, None).await?;
                return Ok(());
            }
            let text = admin_panel_view(&data, &state);
            respond(&bot, anchor.as_ref(), &user, &text, None).await?;
        }
        other => {
            warn!("Unknown callback data: {other}");
        }
    }

    Ok(())
}

fn feedback_reason(data: &str) -> &'static str {
    match data {
        "reason_inaccurate" => "Неточный ответ",
        "reason_unclear" => "Непонятный ответ",
        "reason_short" => "Слишком краткий ответ",
        "reason_long" => "Слишком длинный ответ",
        "reason_other" => "Другое",
        _ => "Неизвестная причина",
    }
}

fn admin_panel_view(data: &str, state: &BotState) -> String {
    match data {
        "admin_stats" => {
            let days = state.log.daily_counts();
            if days.is_empty() {
                return "❌ Не удалось получить детальную статистику.".to_string();
            }
            let mut text = String::from("📊 Детальная статистика взаимодействий за 7 дней:\n\n");
            for (date, count) in &days {
                text.push_str(&format!("📅 {date}: {count} взаимодействий\n"));
            }
            text
        }
        "admin_users" => {
            let users = state.log.recent_users(10);
            if users.is_empty() {
                return "❌ Не удалось получить список пользователей.".to_string();
            }
            let mut text = String::from("👥 Последние активные пользователи:\n\n");
            for user in &users {
                let name = user.username.as_deref().unwrap_or("Без имени");
                text.push_str(&format!(
                    "👤 {} (ID: {})\n🕒 Последнее взаимодействие: {}\n\n",
                    name, user.user_id, user.last_interaction
                ));
            }
            text
        }
        "admin_logs" => {
            format!(
                "🔍 Последние системные логи:\n\n{}",
                tail_file(&state.config.log_file(), 20)
            )
        }
        "admin_settings" => {
            format!(
                "🛠 Настройки бота:\n\n\
                 🤖 Модель: {}\n\
                 📝 Режим форматирования: {}\n\
                 📊 Лимит одновременных запросов: {}\n\
                 📡 Статус: Активен",
                state.model.model(),
                state.model.mode().as_str(),
                state.model.max_concurrent()
            )
        }
        _ => "Неизвестный раздел панели.".to_string(),
    }
}

fn tail_file(path: &std::path::Path, lines: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            all[start..].join("\n")
        }
        Err(e) => format!("Ошибка чтения логов: {e}"),
    }
}

/// Edit the keyboard's message in place when possible, otherwise send a
/// fresh message to the user's private chat.
async fn respond(
    bot: &Bot,
    anchor: Option<&Message>,
    user: &User,
    text: &str,
    keyboard: Option<InlineKeyboardMarkup>,
) -> ResponseResult<()> {
    if let Some(m) = anchor {
        let mut request = bot.edit_message_text(m.chat.id, m.id, text);
        if let Some(kb) = keyboard.clone() {
            request = request.reply_markup(kb);
        }
        if request.await.is_ok() {
            return Ok(());
        }
    }

    let chat = ChatId(user.id.0 as i64);
    match keyboard {
        Some(kb) => {
            bot.send_message(chat, text).reply_markup(kb).await?;
        }
        None => {
            bot.send_message(chat, text).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback_ids(kb: &InlineKeyboardMarkup) -> Vec<String> {
        kb.inline_keyboard
            .iter()
            .flatten()
            .filter_map(|b| match &b.kind {
                teloxide::types::InlineKeyboardButtonKind::CallbackData(data) => {
                    Some(data.clone())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_task_keyboard_buttons() {
        let ids = callback_ids(&task_keyboard());
        assert_eq!(ids, vec!["new_task", "task_completed"]);
    }

    #[test]
    fn test_feedback_flow_keyboards() {
        assert_eq!(callback_ids(&feedback_keyboard()), vec!["feedback_good", "feedback_bad"]);
        assert_eq!(
            callback_ids(&reason_keyboard()),
            vec![
                "reason_inaccurate",
                "reason_unclear",
                "reason_short",
                "reason_long",
                "reason_other"
            ]
        );
        assert_eq!(callback_ids(&comment_keyboard()), vec!["add_comment"]);
    }

    #[test]
    fn test_admin_keyboard_buttons() {
        assert_eq!(
            callback_ids(&admin_keyboard()),
            vec!["admin_stats", "admin_users", "admin_logs", "admin_settings"]
        );
    }

    #[test]
    fn test_history_limit_parsing() {
        assert_eq!(history_limit(""), HISTORY_DEFAULT);
        assert_eq!(history_limit("10"), 10);
        assert_eq!(history_limit("99"), HISTORY_MAX);
        assert_eq!(history_limit("abc"), HISTORY_DEFAULT);
    }

    #[test]
    fn test_chunk_text_short_reply_is_one_chunk() {
        let chunks = chunk_text("hello", REPLY_CHUNK_LIMIT);
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn test_chunk_text_splits_long_reply() {
        let text = "a".repeat(REPLY_CHUNK_LIMIT * 2 + 100);
        let chunks = chunk_text(&text, REPLY_CHUNK_LIMIT);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= REPLY_CHUNK_LIMIT));
        assert_eq!(chunks[2].chars().count(), 100);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_chunk_text_counts_chars_not_bytes() {
        let text = "ы".repeat(REPLY_CHUNK_LIMIT + 1);
        let chunks = chunk_text(&text, REPLY_CHUNK_LIMIT);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], "ы");
    }

    #[test]
    fn test_feedback_reason_mapping() {
        assert_eq!(feedback_reason("reason_short"), "Слишком краткий ответ");
        assert_eq!(feedback_reason("reason_other"), "Другое");
        assert_eq!(feedback_reason("reason_bogus"), "Неизвестная причина");
    }

    #[test]
    fn test_preview_truncates_long_responses() {
        let long = "д".repeat(900);
        let shown = preview(&long, HISTORY_PREVIEW_CHARS);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.chars().count(), HISTORY_PREVIEW_CHARS + 3);
        assert_eq!(preview("short", HISTORY_PREVIEW_CHARS), "short");
    }

    #[test]
    fn test_tail_file_returns_last_lines() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..30 {
            writeln!(file, "line {i}").unwrap();
        }
        let tail = tail_file(file.path(), 20);
        assert!(tail.starts_with("line 10"));
        assert!(tail.ends_with("line 29"));
        assert_eq!(tail.lines().count(), 20);
    }
}
