mod client;
pub mod format;
mod types;

pub use client::{ApiError, TelegramClient};
pub use types::{Chat, Document, FileInfo, Message, MessageEntity, PhotoSize, Update, User};
