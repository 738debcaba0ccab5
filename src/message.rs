//! WAMP message types
//!
//! Every message travels as an array of fields whose first element is the
//! numeric type code: `[TypeCode, ...fields]`. [`Message::parse`] turns that
//! array into a typed message and [`Message::payload`] turns it back.

use crate::error::{Result, WampError};
use serde_json::Value;

/// Keyword dictionary (`details`, `options`, `kwargs`)
pub type Dict = serde_json::Map<String, Value>;

/// Positional argument list
pub type List = Vec<Value>;

/// Session, request, subscription and publication identifiers
pub type Id = u64;

/// Numeric type codes of the messages this client understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MessageType {
    Hello = 1,
    Welcome = 2,
    Abort = 3,
    Challenge = 4,
    Authenticate = 5,
    Goodbye = 6,
    Error = 8,
    Publish = 16,
    Published = 17,
    Subscribe = 32,
    Subscribed = 33,
    Unsubscribe = 34,
    Unsubscribed = 35,
    Event = 36,
}

impl MessageType {
    /// Look up a type code; `None` for codes outside this client's subset
    pub fn from_code(code: u64) -> Option<Self> {
        let ty = match code {
            1 => Self::Hello,
            2 => Self::Welcome,
            3 => Self::Abort,
            4 => Self::Challenge,
            5 => Self::Authenticate,
            6 => Self::Goodbye,
            8 => Self::Error,
            16 => Self::Publish,
            17 => Self::Published,
            32 => Self::Subscribe,
            33 => Self::Subscribed,
            34 => Self::Unsubscribe,
            35 => Self::Unsubscribed,
            36 => Self::Event,
            _ => return None,
        };
        Some(ty)
    }

    pub fn code(self) -> u64 {
        self as u64
    }
}

/// A typed WAMP message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `[HELLO, Realm|uri, Details|dict]`
    Hello { realm: String, details: Dict },

    /// `[WELCOME, Session|id, Details|dict]`
    Welcome { session: Id, details: Dict },

    /// `[ABORT, Details|dict, Reason|uri]`
    Abort { details: Dict, reason: String },

    /// `[CHALLENGE, AuthMethod|string, Extra|dict]`
    Challenge { authmethod: String, extra: Dict },

    /// `[AUTHENTICATE, Signature|string, Extra|dict]`
    Authenticate { signature: String, extra: Dict },

    /// `[GOODBYE, Details|dict, Reason|uri]`
    Goodbye { details: Dict, reason: String },

    /// `[ERROR, REQUEST.Type|int, REQUEST.Request|id, Details|dict, Error|uri, Arguments|list, ArgumentsKw|dict]`
    Error {
        request_type: u64,
        request: Id,
        details: Dict,
        error: String,
        arguments: Option<List>,
        arguments_kw: Option<Dict>,
    },

    /// `[PUBLISH, Request|id, Options|dict, Topic|uri, Arguments|list, ArgumentsKw|dict]`
    Publish {
        request: Id,
        options: Dict,
        topic: String,
        arguments: Option<List>,
        arguments_kw: Option<Dict>,
    },

    /// `[PUBLISHED, PUBLISH.Request|id, Publication|id]`
    Published { request: Id, publication: Id },

    /// `[SUBSCRIBE, Request|id, Options|dict, Topic|uri]`
    Subscribe {
        request: Id,
        options: Dict,
        topic: String,
    },

    /// `[SUBSCRIBED, SUBSCRIBE.Request|id, Subscription|id]`
    Subscribed { request: Id, subscription: Id },

    /// `[UNSUBSCRIBE, Request|id, SUBSCRIBED.Subscription|id]`
    Unsubscribe { request: Id, subscription: Id },

    /// `[UNSUBSCRIBED, UNSUBSCRIBE.Request|id]`
    Unsubscribed { request: Id },

    /// `[EVENT, SUBSCRIBED.Subscription|id, PUBLISHED.Publication|id, Details|dict, Arguments|list, ArgumentsKw|dict]`
    Event {
        subscription: Id,
        publication: Id,
        details: Dict,
        arguments: Option<List>,
        arguments_kw: Option<Dict>,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello { .. } => MessageType::Hello,
            Message::Welcome { .. } => MessageType::Welcome,
            Message::Abort { .. } => MessageType::Abort,
            Message::Challenge { .. } => MessageType::Challenge,
            Message::Authenticate { .. } => MessageType::Authenticate,
            Message::Goodbye { .. } => MessageType::Goodbye,
            Message::Error { .. } => MessageType::Error,
            Message::Publish { .. } => MessageType::Publish,
            Message::Published { .. } => MessageType::Published,
            Message::Subscribe { .. } => MessageType::Subscribe,
            Message::Subscribed { .. } => MessageType::Subscribed,
            Message::Unsubscribe { .. } => MessageType::Unsubscribe,
            Message::Unsubscribed { .. } => MessageType::Unsubscribed,
            Message::Event { .. } => MessageType::Event,
        }
    }

    /// Parse the array-of-fields form into a typed message
    pub fn parse(payload: &[Value]) -> Result<Self> {
        let fields = Fields(payload);
        let code = fields.id(0, "type code")?;
        let ty = MessageType::from_code(code).ok_or(WampError::UnknownMessageType(code))?;

        let message = match ty {
            MessageType::Hello => Message::Hello {
                realm: fields.string(1, "realm")?,
                details: fields.dict(2, "details")?,
            },
            MessageType::Welcome => Message::Welcome {
                session: fields.id(1, "session")?,
                details: fields.dict(2, "details")?,
            },
            MessageType::Abort => Message::Abort {
                details: fields.dict(1, "details")?,
                reason: fields.string(2, "reason")?,
            },
            MessageType::Challenge => Message::Challenge {
                authmethod: fields.string(1, "authmethod")?,
                extra: fields.dict(2, "extra")?,
            },
            MessageType::Authenticate => Message::Authenticate {
                signature: fields.string(1, "signature")?,
                extra: fields.dict(2, "extra")?,
            },
            MessageType::Goodbye => Message::Goodbye {
                details: fields.dict(1, "details")?,
                reason: fields.string(2, "reason")?,
            },
            MessageType::Error => Message::Error {
                request_type: fields.id(1, "request type")?,
                request: fields.id(2, "request")?,
                details: fields.dict(3, "details")?,
                error: fields.string(4, "error")?,
                arguments: fields.optional_list(5, "arguments")?,
                arguments_kw: fields.optional_dict(6, "arguments_kw")?,
            },
            MessageType::Publish => Message::Publish {
                request: fields.id(1, "request")?,
                options: fields.dict(2, "options")?,
                topic: fields.string(3, "topic")?,
                arguments: fields.optional_list(4, "arguments")?,
                arguments_kw: fields.optional_dict(5, "arguments_kw")?,
            },
            MessageType::Published => Message::Published {
                request: fields.id(1, "request")?,
                publication: fields.id(2, "publication")?,
            },
            MessageType::Subscribe => Message::Subscribe {
                request: fields.id(1, "request")?,
                options: fields.dict(2, "options")?,
                topic: fields.string(3, "topic")?,
            },
            MessageType::Subscribed => Message::Subscribed {
                request: fields.id(1, "request")?,
                subscription: fields.id(2, "subscription")?,
            },
            MessageType::Unsubscribe => Message::Unsubscribe {
                request: fields.id(1, "request")?,
                subscription: fields.id(2, "subscription")?,
            },
            MessageType::Unsubscribed => Message::Unsubscribed {
                request: fields.id(1, "request")?,
            },
            MessageType::Event => Message::Event {
                subscription: fields.id(1, "subscription")?,
                publication: fields.id(2, "publication")?,
                details: fields.dict(3, "details")?,
                arguments: fields.optional_list(4, "arguments")?,
                arguments_kw: fields.optional_dict(5, "arguments_kw")?,
            },
        };

        Ok(message)
    }

    /// Build the array-of-fields wire form
    pub fn payload(&self) -> List {
        let mut payload = vec![Value::from(self.message_type().code())];

        match self {
            Message::Hello { realm, details } => {
                payload.push(Value::from(realm.as_str()));
                payload.push(Value::Object(details.clone()));
            }
            Message::Welcome { session, details } => {
                payload.push(Value::from(*session));
                payload.push(Value::Object(details.clone()));
            }
            Message::Abort { details, reason } | Message::Goodbye { details, reason } => {
                payload.push(Value::Object(details.clone()));
                payload.push(Value::from(reason.as_str()));
            }
            Message::Challenge {
                authmethod: text,
                extra,
            }
            | Message::Authenticate {
                signature: text,
                extra,
            } => {
                payload.push(Value::from(text.as_str()));
                payload.push(Value::Object(extra.clone()));
            }
            Message::Error {
                request_type,
                request,
                details,
                error,
                arguments,
                arguments_kw,
            } => {
                payload.push(Value::from(*request_type));
                payload.push(Value::from(*request));
                payload.push(Value::Object(details.clone()));
                payload.push(Value::from(error.as_str()));
                push_arguments(&mut payload, arguments, arguments_kw);
            }
            Message::Publish {
                request,
                options,
                topic,
                arguments,
                arguments_kw,
            } => {
                payload.push(Value::from(*request));
                payload.push(Value::Object(options.clone()));
                payload.push(Value::from(topic.as_str()));
                push_arguments(&mut payload, arguments, arguments_kw);
            }
            Message::Published {
                request,
                publication: second,
            }
            | Message::Subscribed {
                request,
                subscription: second,
            }
            | Message::Unsubscribe {
                request,
                subscription: second,
            } => {
                payload.push(Value::from(*request));
                payload.push(Value::from(*second));
            }
            Message::Subscribe {
                request,
                options,
                topic,
            } => {
                payload.push(Value::from(*request));
                payload.push(Value::Object(options.clone()));
                payload.push(Value::from(topic.as_str()));
            }
            Message::Unsubscribed { request } => {
                payload.push(Value::from(*request));
            }
            Message::Event {
                subscription,
                publication,
                details,
                arguments,
                arguments_kw,
            } => {
                payload.push(Value::from(*subscription));
                payload.push(Value::from(*publication));
                payload.push(Value::Object(details.clone()));
                push_arguments(&mut payload, arguments, arguments_kw);
            }
        }

        payload
    }
}

/// Append the optional argument trailer.
///
/// `kwargs` can only be sent positionally after `args`, so an empty list is
/// emitted in front of it when only keyword arguments are present.
fn push_arguments(payload: &mut List, arguments: &Option<List>, arguments_kw: &Option<Dict>) {
    match (arguments, arguments_kw) {
        (None, None) => {}
        (Some(args), None) => payload.push(Value::Array(args.clone())),
        (args, Some(kwargs)) => {
            payload.push(Value::Array(args.clone().unwrap_or_default()));
            payload.push(Value::Object(kwargs.clone()));
        }
    }
}

/// Positional field accessors with descriptive errors
struct Fields<'a>(&'a [Value]);

impl Fields<'_> {
    fn get(&self, index: usize, name: &str) -> Result<&Value> {
        self.0
            .get(index)
            .ok_or_else(|| WampError::MalformedMessage(format!("missing field '{name}'")))
    }

    fn id(&self, index: usize, name: &str) -> Result<Id> {
        self.get(index, name)?
            .as_u64()
            .ok_or_else(|| WampError::MalformedMessage(format!("field '{name}' must be an id")))
    }

    fn string(&self, index: usize, name: &str) -> Result<String> {
        self.get(index, name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| WampError::MalformedMessage(format!("field '{name}' must be a string")))
    }

    fn dict(&self, index: usize, name: &str) -> Result<Dict> {
        match self.get(index, name)? {
            Value::Object(dict) => Ok(dict.clone()),
            _ => Err(WampError::MalformedMessage(format!(
                "field '{name}' must be a dict"
            ))),
        }
    }

    fn optional_list(&self, index: usize, name: &str) -> Result<Option<List>> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(list)) => Ok(Some(list.clone())),
            Some(_) => Err(WampError::MalformedMessage(format!(
                "field '{name}' must be a list"
            ))),
        }
    }

    fn optional_dict(&self, index: usize, name: &str) -> Result<Option<Dict>> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(dict)) => Ok(Some(dict.clone())),
            Some(_) => Err(WampError::MalformedMessage(format!(
                "field '{name}' must be a dict"
            ))),
        }
    }
}
