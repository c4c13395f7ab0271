//! Live chat message decoder
//!
//! Converts raw `youtube#liveChatMessage` resources into [`Event`] values.
//! Items are decoded once, at the feed boundary:
//! - known message types become the matching event variant
//! - `chatEndedEvent` yields [`ParsedItem::Ended`]
//! - any other type is skipped (polls, sponsor-only mode toggles, tombstones)
//! - a known type missing required fields is a [`ParseError`]

use super::FeedPage;
use crate::metrics;
use crate::{
    Author, BanType, BannedUser, Event, GiftMembershipEvent, GiftMembershipReceivedEvent,
    MembershipEvent, MembershipMilestoneEvent, MessageDeleted, MessageMeta, Money, SuperChatEvent,
    SuperStickerEvent, TextMessage, UserBanned,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Parse errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    /// The item does not match the resource schema
    #[error("malformed item {id}: {reason}")]
    Malformed {
        /// Item ID, or `"<unknown>"`
        id: String,
        /// What was wrong
        reason: String,
    },
}

/// Outcome of decoding one raw item
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedItem {
    /// A publishable event
    Event(Event),
    /// The feed reported that the chat has ended
    Ended,
    /// A message type with no event mapping
    Skipped {
        /// The raw `snippet.type`
        message_type: String,
    },
}

/// Events decoded from one page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPage {
    /// Events in feed order
    pub events: Vec<Event>,
    /// Whether the page signalled the end of the feed
    pub ended: bool,
    /// Items skipped as unknown types
    pub skipped: usize,
    /// Items that failed to decode
    pub malformed: usize,
}

const KNOWN_TYPES: &[&str] = &[
    "textMessageEvent",
    "superChatEvent",
    "superStickerEvent",
    "newSponsorEvent",
    "memberMilestoneChatEvent",
    "membershipGiftingEvent",
    "giftMembershipReceivedEvent",
    "messageDeletedEvent",
    "userBannedEvent",
    "chatEndedEvent",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    snippet: Snippet,
    #[serde(default)]
    author_details: Option<AuthorDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    author_channel_id: String,
    published_at: DateTime<Utc>,
    #[serde(default)]
    display_message: Option<String>,
    #[serde(default)]
    text_message_details: Option<TextMessageDetails>,
    #[serde(default)]
    super_chat_details: Option<SuperChatDetails>,
    #[serde(default)]
    super_sticker_details: Option<SuperStickerDetails>,
    #[serde(default)]
    new_sponsor_details: Option<NewSponsorDetails>,
    #[serde(default)]
    member_milestone_chat_details: Option<MemberMilestoneDetails>,
    #[serde(default)]
    membership_gifting_details: Option<MembershipGiftingDetails>,
    #[serde(default)]
    gift_membership_received_details: Option<GiftMembershipReceivedDetails>,
    #[serde(default)]
    message_deleted_details: Option<MessageDeletedDetails>,
    #[serde(default)]
    user_banned_details: Option<UserBannedDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorDetails {
    channel_id: String,
    #[serde(default)]
    channel_url: Option<String>,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    profile_image_url: Option<String>,
    #[serde(default)]
    is_verified: bool,
    #[serde(default)]
    is_chat_owner: bool,
    #[serde(default)]
    is_chat_sponsor: bool,
    #[serde(default)]
    is_chat_moderator: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextMessageDetails {
    message_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuperChatDetails {
    #[serde(deserialize_with = "lenient_u64")]
    amount_micros: u64,
    currency: String,
    #[serde(default)]
    amount_display_string: String,
    #[serde(default)]
    user_comment: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    tier: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuperStickerDetails {
    super_sticker_metadata: StickerMetadata,
    #[serde(deserialize_with = "lenient_u64")]
    amount_micros: u64,
    currency: String,
    #[serde(default)]
    amount_display_string: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    tier: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StickerMetadata {
    sticker_id: String,
    #[serde(default)]
    alt_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSponsorDetails {
    #[serde(default)]
    member_level_name: String,
    #[serde(default)]
    is_upgrade: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberMilestoneDetails {
    #[serde(default)]
    member_level_name: String,
    #[serde(deserialize_with = "lenient_u64")]
    member_month: u64,
    #[serde(default)]
    user_comment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembershipGiftingDetails {
    #[serde(deserialize_with = "lenient_u64")]
    gift_memberships_count: u64,
    #[serde(default)]
    gift_memberships_level_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GiftMembershipReceivedDetails {
    #[serde(default)]
    member_level_name: String,
    gifter_channel_id: String,
    #[serde(default)]
    associated_membership_gifting_message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDeletedDetails {
    deleted_message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserBannedDetails {
    banned_user_details: BannedUserDetails,
    ban_type: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    ban_duration_seconds: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BannedUserDetails {
    channel_id: String,
    #[serde(default)]
    display_name: String,
}

// The Data API encodes 64-bit integers as JSON strings.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("expected unsigned integer, got {n}"))),
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!("expected integer, got {other}"))),
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

fn to_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

/// Stateless decoder for live chat message resources
pub struct ItemParser;

impl ItemParser {
    /// Decode one raw item
    ///
    /// # Errors
    /// Returns [`ParseError::Malformed`] when a known message type is missing
    /// required fields or carries invalid values.
    pub fn parse_item(raw: &Value, received_at: DateTime<Utc>) -> Result<ParsedItem, ParseError> {
        let id_hint = raw
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>")
            .to_string();
        let malformed = |reason: String| ParseError::Malformed {
            id: id_hint.clone(),
            reason,
        };

        let message_type = raw
            .pointer("/snippet/type")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing snippet.type".to_string()))?;

        if !KNOWN_TYPES.contains(&message_type) {
            return Ok(ParsedItem::Skipped {
                message_type: message_type.to_string(),
            });
        }
        if message_type == "chatEndedEvent" {
            return Ok(ParsedItem::Ended);
        }

        let message: RawMessage =
            serde_json::from_value(raw.clone()).map_err(|e| malformed(e.to_string()))?;
        Self::build_event(message, received_at)
            .map(ParsedItem::Event)
            .map_err(malformed)
    }

    /// Decode every item of a page, logging and counting what is not published
    pub fn decode_page(page: &FeedPage, received_at: DateTime<Utc>) -> DecodedPage {
        let mut decoded = DecodedPage {
            events: Vec::with_capacity(page.items.len()),
            ended: page.offline_at.is_some(),
            ..DecodedPage::default()
        };

        for raw in &page.items {
            match Self::parse_item(raw, received_at) {
                Ok(ParsedItem::Event(event)) => decoded.events.push(event),
                Ok(ParsedItem::Ended) => decoded.ended = true,
                Ok(ParsedItem::Skipped { message_type }) => {
                    debug!(message_type = %message_type, "Skipping unsupported chat item");
                    metrics::record_item_skipped("unsupported_type");
                    decoded.skipped += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable chat item");
                    metrics::record_item_skipped("malformed");
                    decoded.malformed += 1;
                }
            }
        }

        decoded
    }

    fn build_event(message: RawMessage, received_at: DateTime<Utc>) -> Result<Event, String> {
        let RawMessage {
            id,
            snippet,
            author_details,
        } = message;

        let author = match author_details {
            Some(a) => Author {
                channel_id: a.channel_id,
                display_name: a.display_name,
                channel_url: a.channel_url,
                profile_image_url: a.profile_image_url,
                is_verified: a.is_verified,
                is_chat_owner: a.is_chat_owner,
                is_chat_sponsor: a.is_chat_sponsor,
                is_chat_moderator: a.is_chat_moderator,
            },
            None => Author {
                channel_id: snippet.author_channel_id.clone(),
                ..Author::default()
            },
        };

        let meta = MessageMeta {
            id,
            author,
            published_at: snippet.published_at,
            received_at,
        };
        meta.validate()?;

        let missing = |field: &str| format!("{} without {field}", snippet.message_type);

        let event = match snippet.message_type.as_str() {
            "textMessageEvent" => {
                let text = snippet
                    .text_message_details
                    .map(|d| d.message_text)
                    .or(snippet.display_message)
                    .ok_or_else(|| missing("textMessageDetails"))?;
                Event::TextMessage(TextMessage { meta, text })
            }
            "superChatEvent" => {
                let d = snippet
                    .super_chat_details
                    .ok_or_else(|| missing("superChatDetails"))?;
                let money = Money {
                    amount_micros: d.amount_micros,
                    currency: d.currency,
                    display: d.amount_display_string,
                };
                money.validate()?;
                Event::SuperChat(SuperChatEvent {
                    meta,
                    money,
                    comment: non_empty(d.user_comment),
                    tier: to_u32(d.tier),
                })
            }
            "superStickerEvent" => {
                let d = snippet
                    .super_sticker_details
                    .ok_or_else(|| missing("superStickerDetails"))?;
                let money = Money {
                    amount_micros: d.amount_micros,
                    currency: d.currency,
                    display: d.amount_display_string,
                };
                money.validate()?;
                Event::SuperSticker(SuperStickerEvent {
                    meta,
                    money,
                    sticker_id: d.super_sticker_metadata.sticker_id,
                    alt_text: d.super_sticker_metadata.alt_text,
                    tier: to_u32(d.tier),
                })
            }
            "newSponsorEvent" => {
                let d = snippet.new_sponsor_details.unwrap_or(NewSponsorDetails {
                    member_level_name: String::new(),
                    is_upgrade: false,
                });
                Event::Membership(MembershipEvent {
                    meta,
                    level_name: d.member_level_name,
                    is_upgrade: d.is_upgrade,
                })
            }
            "memberMilestoneChatEvent" => {
                let d = snippet
                    .member_milestone_chat_details
                    .ok_or_else(|| missing("memberMilestoneChatDetails"))?;
                Event::MembershipMilestone(MembershipMilestoneEvent {
                    meta,
                    level_name: d.member_level_name,
                    months: to_u32(d.member_month),
                    comment: non_empty(d.user_comment),
                })
            }
            "membershipGiftingEvent" => {
                let d = snippet
                    .membership_gifting_details
                    .ok_or_else(|| missing("membershipGiftingDetails"))?;
                Event::GiftMembership(GiftMembershipEvent {
                    meta,
                    count: to_u32(d.gift_memberships_count),
                    level_name: d.gift_memberships_level_name,
                })
            }
            "giftMembershipReceivedEvent" => {
                let d = snippet
                    .gift_membership_received_details
                    .ok_or_else(|| missing("giftMembershipReceivedDetails"))?;
                Event::GiftMembershipReceived(GiftMembershipReceivedEvent {
                    meta,
                    level_name: d.member_level_name,
                    gifter_channel_id: d.gifter_channel_id,
                    gifting_message_id: d.associated_membership_gifting_message_id,
                })
            }
            "messageDeletedEvent" => {
                let d = snippet
                    .message_deleted_details
                    .ok_or_else(|| missing("messageDeletedDetails"))?;
                Event::MessageDeleted(MessageDeleted {
                    meta,
                    deleted_message_id: d.deleted_message_id,
                })
            }
            "userBannedEvent" => {
                let d = snippet
                    .user_banned_details
                    .ok_or_else(|| missing("userBannedDetails"))?;
                let ban = match d.ban_type.as_str() {
                    "permanent" => BanType::Permanent,
                    "temporary" => BanType::Temporary {
                        duration: Duration::from_secs(d.ban_duration_seconds),
                    },
                    other => return Err(format!("unknown ban type {other:?}")),
                };
                Event::UserBanned(UserBanned {
                    meta,
                    banned: BannedUser {
                        channel_id: d.banned_user_details.channel_id,
                        display_name: d.banned_user_details.display_name,
                    },
                    ban,
                })
            }
            other => return Err(format!("no decoder for {other}")),
        };

        Ok(event)
    }
}
