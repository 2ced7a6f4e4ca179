use std::time::SystemTime;

use serde_json::Value;

use crate::util;
use crate::Error;

pub(crate) const SDK_TYPE: &str = "rust-sdk";
pub(crate) const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) const EVENT_TYPE_VALUE: &str = "Event";
pub(crate) const MUTATION_TYPE_DEVICE: &str = "DeviceMutation";
pub(crate) const MUTATION_TYPE_USER: &str = "UserMutation";

pub(crate) const FIELD_SDK_TYPE: &str = "#sdk_type";
pub(crate) const FIELD_SDK_VERSION: &str = "#sdk_version";
pub(crate) const FIELD_EVENT: &str = "#event";
pub(crate) const FIELD_TIME: &str = "#time";
pub(crate) const FIELD_LOG_ID: &str = "#log_id";
pub(crate) const FIELD_OPERATE: &str = "#operate";
pub(crate) const FIELD_IDENTIFY: &str = "#identify";
pub(crate) const FIELD_IP: &str = "#ip";
pub(crate) const FIELD_PROPERTIES: &str = "properties";

/// User-supplied property bag. The map is key-sorted, so serialization is
/// deterministic, and values keep their JSON number representation.
pub type Props = serde_json::Map<String, Value>;

/// One serialized message as accepted by the producers: a
/// `{"type": ..., "data": {...}}` mapping.
pub(crate) type Record = serde_json::Map<String, Value>;

/// A user-facing action with a name and a property bag.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    /// Event time; the current time when `None`.
    pub time: Option<SystemTime>,
    pub props: Props,
}

impl Event {
    pub fn new<N: Into<String>>(name: N, props: Props) -> Event {
        Event { name: name.into(), time: None, props }
    }
}

/// An update to a user or device attribute set. Whether it targets a user or
/// a device profile is decided by the [`Message`] variant wrapping it.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub identity: String,
    pub operate: Operate,
    pub time: Option<SystemTime>,
    pub props: Props,
}

impl Mutation {
    pub fn new<I: Into<String>>(operate: Operate, identity: I, props: Props) -> Mutation {
        Mutation { identity: identity.into(), operate, time: None, props }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operate {
    Set,
    SetOnce,
    Add,
}

impl Operate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operate::Set => "set",
            Operate::SetOnce => "setOnce",
            Operate::Add => "add",
        }
    }
}

/// Everything the SDK can report.
#[derive(Debug, Clone)]
pub enum Message {
    Event(Event),
    DeviceMutation(Mutation),
    UserMutation(Mutation),
}

impl From<Event> for Message {
    fn from(event: Event) -> Message {
        Message::Event(event)
    }
}

impl Message {
    pub(crate) fn check(&self) -> Result<(), Error> {
        match self {
            Message::Event(event) => {
                if event.name.is_empty() {
                    return Err(Error::InvalidMessage("event name can not be empty".into()));
                }
            }
            Message::DeviceMutation(mutation) | Message::UserMutation(mutation) => {
                if mutation.identity.is_empty() {
                    return Err(Error::InvalidMessage("mutation identity can not be empty".into()));
                }
            }
        }
        Ok(())
    }

    /// Render the message as a reportable record, injecting the SDK fields.
    pub(crate) fn into_record(self) -> Record {
        match self {
            Message::Event(event) => {
                let time = event.time.map(util::unix_millis).unwrap_or_else(util::now_millis);
                let mut data = event.props;
                data.insert(FIELD_SDK_TYPE.into(), Value::from(SDK_TYPE));
                data.insert(FIELD_SDK_VERSION.into(), Value::from(SDK_VERSION));
                data.insert(FIELD_EVENT.into(), Value::from(event.name));
                data.insert(FIELD_TIME.into(), Value::from(time));
                data.insert(FIELD_LOG_ID.into(), Value::from(util::generate_log_id()));
                record(EVENT_TYPE_VALUE, data)
            }
            Message::DeviceMutation(mutation) => mutation_record(MUTATION_TYPE_DEVICE, mutation),
            Message::UserMutation(mutation) => mutation_record(MUTATION_TYPE_USER, mutation),
        }
    }
}

fn mutation_record(type_value: &str, mutation: Mutation) -> Record {
    let time = mutation.time.map(util::unix_millis).unwrap_or_else(util::now_millis);
    let mut data = Props::new();
    data.insert(FIELD_SDK_TYPE.into(), Value::from(SDK_TYPE));
    data.insert(FIELD_SDK_VERSION.into(), Value::from(SDK_VERSION));
    data.insert(FIELD_TIME.into(), Value::from(time));
    data.insert(FIELD_LOG_ID.into(), Value::from(util::generate_log_id()));
    data.insert(FIELD_OPERATE.into(), Value::from(mutation.operate.as_str()));
    data.insert(FIELD_IDENTIFY.into(), Value::from(mutation.identity));
    data.insert(FIELD_PROPERTIES.into(), Value::Object(mutation.props));
    record(type_value, data)
}

fn record(type_value: &str, data: Props) -> Record {
    let mut record = Record::new();
    record.insert("type".into(), Value::from(type_value));
    record.insert("data".into(), Value::Object(data));
    record
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn props() -> Props {
        let mut props = Props::new();
        props.insert("field1".into(), Value::from(1));
        props.insert("field2".into(), Value::from("2"));
        props
    }

    #[test]
    fn event_record_carries_sdk_fields() {
        let time = UNIX_EPOCH + Duration::from_millis(1_700_000_000_000);
        let event = Event { name: "UserLogin".into(), time: Some(time), props: props() };

        let record = Message::from(event).into_record();
        assert_eq!(EVENT_TYPE_VALUE, record["type"].as_str().unwrap());

        let data = record["data"].as_object().unwrap();
        assert_eq!(SDK_TYPE, data[FIELD_SDK_TYPE].as_str().unwrap());
        assert_eq!(SDK_VERSION, data[FIELD_SDK_VERSION].as_str().unwrap());
        assert_eq!("UserLogin", data[FIELD_EVENT].as_str().unwrap());
        assert_eq!(1_700_000_000_000i64, data[FIELD_TIME].as_i64().unwrap());
        assert!(!data[FIELD_LOG_ID].as_str().unwrap().is_empty());
        assert_eq!(1, data["field1"].as_i64().unwrap());
        assert_eq!("2", data["field2"].as_str().unwrap());
    }

    #[test]
    fn event_without_time_gets_current_time() {
        let before = crate::util::now_millis();
        let record = Message::from(Event::new("UserLogin", props())).into_record();
        let time = record["data"]["#time"].as_i64().unwrap();
        assert!(time >= before);
    }

    #[test]
    fn mutation_record_nests_user_props() {
        let mutation = Mutation::new(Operate::Set, "user-id-1", props());
        let record = Message::UserMutation(mutation).into_record();
        assert_eq!(MUTATION_TYPE_USER, record["type"].as_str().unwrap());

        let data = record["data"].as_object().unwrap();
        assert_eq!("set", data[FIELD_OPERATE].as_str().unwrap());
        assert_eq!("user-id-1", data[FIELD_IDENTIFY].as_str().unwrap());
        assert!(!data[FIELD_LOG_ID].as_str().unwrap().is_empty());

        let properties = data[FIELD_PROPERTIES].as_object().unwrap();
        assert_eq!(1, properties["field1"].as_i64().unwrap());
        assert_eq!("2", properties["field2"].as_str().unwrap());
        // User fields live under properties, not beside the header fields.
        assert!(data.get("field1").is_none());
    }

    #[test]
    fn device_mutation_type_value() {
        let mutation = Mutation::new(Operate::Add, "device-1", Props::new());
        let record = Message::DeviceMutation(mutation).into_record();
        assert_eq!(MUTATION_TYPE_DEVICE, record["type"].as_str().unwrap());
    }

    #[test]
    fn serialization_is_deterministic_and_sorted() {
        let mut props = Props::new();
        props.insert("zebra".into(), Value::from(1));
        props.insert("alpha".into(), Value::from(2));
        let record = Message::from(Event { name: "E".into(), time: Some(UNIX_EPOCH), props }).into_record();

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.find("\"alpha\"").unwrap() < json.find("\"zebra\"").unwrap());
        // `#`-prefixed fields sort before plain names.
        assert!(json.find("\"#event\"").unwrap() < json.find("\"alpha\"").unwrap());
    }

    #[test]
    fn checks_reject_empty_names() {
        let event = Event::new("", Props::new());
        assert!(Message::from(event).check().is_err());

        let mutation = Mutation::new(Operate::Set, "", Props::new());
        assert!(Message::UserMutation(mutation).check().is_err());

        let ok = Mutation::new(Operate::SetOnce, "id", Props::new());
        assert!(Message::UserMutation(ok).check().is_ok());
    }
}
