//! User-supplied search filters.
//!
//! Filters form a closed set per record kind. Each active filter carries a
//! value list plus two modifiers: `conjunct` (all values must match instead
//! of any) and `negative` (invert the verdict). A record is emitted when
//! every active filter passes.

use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::{
    error::{ProviderError, Result},
    model::{ProviderEvent, ProviderMessage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilterKind {
    /// Substring over the event name.
    Name,
    /// Substring over the event type.
    Type,
    /// Substring over the serialized event body.
    Body,
    /// Exact match against attached message ids.
    AttachedMessageId,
    /// Exact match against the parent event id.
    ParentId,
}

impl EventFilterKind {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "name" => Ok(Self::Name),
            "type" => Ok(Self::Type),
            "body" => Ok(Self::Body),
            "attachedMessageId" => Ok(Self::AttachedMessageId),
            "parentId" => Ok(Self::ParentId),
            other => Err(ProviderError::InvalidRequest(format!(
                "unknown event filter '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFilterKind {
    /// Substring over the decoded message type.
    Type,
    /// Substring over the serialized decoded body.
    Body,
    /// Byte-substring over the raw payload; needs no decoding.
    BodyBinary,
    /// Exact match against attached event ids.
    AttachedEventIds,
}

impl MessageFilterKind {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "type" => Ok(Self::Type),
            "body" => Ok(Self::Body),
            "bodyBinary" => Ok(Self::BodyBinary),
            "attachedEventIds" => Ok(Self::AttachedEventIds),
            other => Err(ProviderError::InvalidRequest(format!(
                "unknown message filter '{other}'"
            ))),
        }
    }

    /// Type and body read the decoder's output; the other kinds evaluate on
    /// the raw stored message.
    fn needs_body(self) -> bool {
        matches!(self, Self::Type | Self::Body)
    }
}

#[derive(Debug, Clone)]
pub struct FilterSpec<K> {
    pub kind: K,
    pub negative: bool,
    pub conjunct: bool,
    pub values: Vec<String>,
}

impl<K> FilterSpec<K> {
    /// Combine per-value verdicts under the conjunct/negative modifiers.
    fn verdict(&self, mut hit: impl FnMut(&str) -> bool) -> bool {
        let matched = if self.conjunct {
            self.values.iter().all(|value| hit(value))
        } else {
            self.values.iter().any(|value| hit(value))
        };
        matched != self.negative
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilterSet {
    filters: Vec<FilterSpec<EventFilterKind>>,
}

impl EventFilterSet {
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn apply(&self, event: &ProviderEvent) -> bool {
        self.filters.iter().all(|filter| match filter.kind {
            EventFilterKind::Name => {
                filter.verdict(|value| contains_ignore_case(&event.name, value))
            }
            EventFilterKind::Type => {
                filter.verdict(|value| contains_ignore_case(&event.event_type, value))
            }
            EventFilterKind::Body => {
                // Body is materialized lazily: serialize once, only when a
                // body filter is active.
                let body = event
                    .content
                    .as_ref()
                    .map(|content| content.to_string())
                    .unwrap_or_default();
                filter.verdict(|value| contains_ignore_case(&body, value))
            }
            EventFilterKind::AttachedMessageId => filter.verdict(|value| {
                event
                    .attached_message_ids
                    .iter()
                    .any(|attached| attached == value)
            }),
            EventFilterKind::ParentId => {
                filter.verdict(|value| event.parent_id.as_deref() == Some(value))
            }
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilterSet {
    filters: Vec<FilterSpec<MessageFilterKind>>,
}

impl MessageFilterSet {
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// True when a verdict requires the decoder's output (message type or
    /// parsed body). When false, every active filter evaluates on the raw
    /// stored message and rejected messages can skip the codec round trip.
    pub fn needs_body(&self) -> bool {
        self.filters.iter().any(|filter| filter.kind.needs_body())
    }

    /// True when evaluation requires the message's attached event ids, so the
    /// pipeline can skip the cross-reference lookup otherwise.
    pub fn needs_attached(&self) -> bool {
        self.filters
            .iter()
            .any(|filter| filter.kind == MessageFilterKind::AttachedEventIds)
    }

    pub fn apply(&self, message: &ProviderMessage) -> bool {
        self.filters.iter().all(|filter| match filter.kind {
            MessageFilterKind::Type => {
                filter.verdict(|value| contains_ignore_case(&message.message_type, value))
            }
            MessageFilterKind::Body => {
                let body = message
                    .body
                    .as_ref()
                    .map(|body| body.to_string())
                    .unwrap_or_default();
                filter.verdict(|value| contains_ignore_case(&body, value))
            }
            MessageFilterKind::BodyBinary => {
                let raw = STANDARD
                    .decode(message.body_base64.as_bytes())
                    .unwrap_or_default();
                filter.verdict(|value| {
                    !value.is_empty()
                        && raw
                            .windows(value.len())
                            .any(|window| window == value.as_bytes())
                })
            }
            MessageFilterKind::AttachedEventIds => filter.verdict(|value| {
                message
                    .attached_event_ids
                    .iter()
                    .any(|attached| attached == value)
            }),
        })
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Collect the raw `filters`/`{name}-*` query parameters into specs.
fn collect_specs(params: &[(String, String)]) -> Result<Vec<(String, FilterSpec<String>)>> {
    let mut specs = Vec::new();
    for (key, value) in params {
        if key == "filters" {
            specs.push((
                value.clone(),
                FilterSpec {
                    kind: value.clone(),
                    negative: false,
                    conjunct: false,
                    values: Vec::new(),
                },
            ));
        }
    }

    for (key, value) in params {
        if let Some(name) = key.strip_suffix("-negative") {
            let spec = lookup_spec(&mut specs, name, key)?;
            spec.negative = parse_flag(key, value)?;
        } else if let Some(name) = key.strip_suffix("-conjunct") {
            let spec = lookup_spec(&mut specs, name, key)?;
            spec.conjunct = parse_flag(key, value)?;
        } else if let Some(name) = key.strip_suffix("-values") {
            let spec = lookup_spec(&mut specs, name, key)?;
            spec.values
                .extend(value.split(',').map(|piece| piece.trim().to_string()));
        }
    }

    for (name, spec) in &specs {
        if spec.values.is_empty() {
            return Err(ProviderError::InvalidRequest(format!(
                "filter '{name}' has no values"
            )));
        }
    }
    Ok(specs)
}

fn lookup_spec<'a>(
    specs: &'a mut [(String, FilterSpec<String>)],
    name: &str,
    key: &str,
) -> Result<&'a mut FilterSpec<String>> {
    specs
        .iter_mut()
        .find(|(spec_name, _)| spec_name == name)
        .map(|(_, spec)| spec)
        .ok_or_else(|| {
            ProviderError::InvalidRequest(format!(
                "parameter '{key}' references a filter not listed in 'filters'"
            ))
        })
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ProviderError::InvalidRequest(format!(
            "invalid boolean '{other}' for parameter '{key}'"
        ))),
    }
}

pub fn build_event_filters(params: &[(String, String)]) -> Result<EventFilterSet> {
    let filters = collect_specs(params)?
        .into_iter()
        .map(|(name, spec)| {
            Ok(FilterSpec {
                kind: EventFilterKind::parse(&name)?,
                negative: spec.negative,
                conjunct: spec.conjunct,
                values: spec.values,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(EventFilterSet { filters })
}

pub fn build_message_filters(params: &[(String, String)]) -> Result<MessageFilterSet> {
    let filters = collect_specs(params)?
        .into_iter()
        .map(|(name, spec)| {
            Ok(FilterSpec {
                kind: MessageFilterKind::parse(&name)?,
                negative: spec.negative,
                conjunct: spec.conjunct,
                values: spec.values,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(MessageFilterSet { filters })
}
