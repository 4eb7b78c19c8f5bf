//! Batch codec for the event set
//!
//! Batch layout:
//! - Byte 0: Wire version
//! - Bytes 1-4: Event count (u32 LE)
//! - Events, back to back
//!
//! Event layout:
//! - Byte 0: Event type
//! - Byte 1: Flags (bit 0: chamber present, bit 1: metadata present)
//! - Bytes 2-5: Chamber ID (LE, only if flagged)
//! - Payload (per type)
//! - Metadata (only if flagged): count (u32 LE) + (string key, value) pairs
//!
//! Strings and byte fields are u32-LE length prefixed. Values carry a one-byte tag.
//! Encoding refuses anything the decoder would refuse, so every event that
//! encodes also decodes back to itself.

use bytes::{BufMut, Bytes, BytesMut};

use operant_core::{
    ChamberId, ComponentBinding, ComponentId, ComponentKind, DecodeError, EncodeError, ErrorKind,
    Event, EventKind, EventType, Metadata, SourceId, StateId, Value,
};

/// Current wire protocol version
pub const WIRE_VERSION: u8 = 2;

/// Maximum events in one batch; `encode_batches` splits above it
pub const MAX_BATCH_EVENTS: usize = u16::MAX as usize;

/// Maximum length of any single string or byte field
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// Maximum nesting of list values
pub const MAX_VALUE_DEPTH: usize = 32;

const FLAG_CHAMBER: u8 = 0b0000_0001;
const FLAG_METADATA: u8 = 0b0000_0010;

// Value tags
const VALUE_NULL: u8 = 0x00;
const VALUE_BOOL: u8 = 0x01;
const VALUE_INT: u8 = 0x02;
const VALUE_FLOAT: u8 = 0x03;
const VALUE_TEXT: u8 = 0x04;
const VALUE_LIST: u8 = 0x05;
const VALUE_BYTES: u8 = 0x06;

/// Encode a single event as a one-element batch
pub fn encode(event: &Event) -> Result<Bytes, EncodeError> {
    encode_batch(std::slice::from_ref(event))
}

/// Encode a batch of events.
///
/// Batches longer than `MAX_BATCH_EVENTS` are refused; `encode_batches`
/// splits them.
pub fn encode_batch(events: &[Event]) -> Result<Bytes, EncodeError> {
    if events.len() > MAX_BATCH_EVENTS {
        return Err(EncodeError::TooManyEvents {
            count: events.len(),
            max: MAX_BATCH_EVENTS,
        });
    }
    let mut buf = BytesMut::with_capacity(5 + events.len() * 16);
    buf.put_u8(WIRE_VERSION);
    put_count(&mut buf, events.len())?;
    for event in events {
        put_event(&mut buf, event)?;
    }
    Ok(buf.freeze())
}

/// Encode any number of events, splitting into as many batches as needed
pub fn encode_batches(events: &[Event]) -> Result<Vec<Bytes>, EncodeError> {
    events.chunks(MAX_BATCH_EVENTS).map(encode_batch).collect()
}

/// Decode one batch. Never panics; malformed input yields a `DecodeError`.
pub fn decode(buf: &[u8]) -> Result<Vec<Event>, DecodeError> {
    let mut reader = Reader::new(buf);

    let version = reader.u8()?;
    if version != WIRE_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let count = reader.u32()? as usize;
    let mut events = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        events.push(read_event(&mut reader)?);
    }

    if reader.remaining() > 0 {
        return Err(DecodeError::TrailingBytes(reader.remaining()));
    }

    Ok(events)
}

fn put_event(buf: &mut BytesMut, event: &Event) -> Result<(), EncodeError> {
    buf.put_u8(event.event_type().to_byte());

    let mut flags = 0u8;
    if event.chamber.is_some() {
        flags |= FLAG_CHAMBER;
    }
    if !event.metadata.is_empty() {
        flags |= FLAG_METADATA;
    }
    buf.put_u8(flags);

    if let Some(chamber) = event.chamber {
        buf.put_slice(&chamber.to_bytes());
    }

    match &event.kind {
        EventKind::Start
        | EventKind::Stop
        | EventKind::Pause
        | EventKind::Resume
        | EventKind::Init
        | EventKind::Exit
        | EventKind::CloseSource
        | EventKind::TaskComplete
        | EventKind::Heartbeat => {}
        EventKind::Clear { delete_loggers } => buf.put_u8(*delete_loggers as u8),
        EventKind::AddTask {
            task_type,
            bindings,
            constants,
        } => {
            put_str(buf, task_type)?;
            put_count(buf, bindings.len())?;
            for binding in bindings {
                put_binding(buf, binding)?;
            }
            put_metadata(buf, constants)?;
        }
        EventKind::AddSource {
            source,
            source_type,
        } => {
            put_str(buf, source.as_str())?;
            put_str(buf, source_type)?;
        }
        EventKind::RemoveSource { source } => put_str(buf, source.as_str())?,
        EventKind::ComponentUpdate { component, value }
        | EventKind::ComponentWrite { component, value } => {
            put_str(buf, component.as_str())?;
            put_value(buf, value, 0)?;
        }
        EventKind::ComponentChanged { component, slot } => {
            put_str(buf, component.as_str())?;
            buf.put_u16_le(*slot);
        }
        EventKind::ComponentRegister {
            component,
            kind,
            address,
        } => {
            put_str(buf, component.as_str())?;
            buf.put_u8(kind.to_byte());
            put_str(buf, address)?;
        }
        EventKind::ComponentClose { component } => put_str(buf, component.as_str())?,
        EventKind::StateEnter { state } | EventKind::StateExit { state } => {
            buf.put_slice(&state.to_bytes());
        }
        EventKind::Timeout { name } => put_str(buf, name)?,
        EventKind::Error {
            kind,
            detail,
            source,
        } => {
            buf.put_u8(kind.to_byte());
            put_str(buf, detail)?;
            match source {
                Some(source) => {
                    buf.put_u8(1);
                    put_str(buf, source.as_str())?;
                }
                None => buf.put_u8(0),
            }
        }
    }

    if !event.metadata.is_empty() {
        put_metadata(buf, &event.metadata)?;
    }
    Ok(())
}

fn read_event(reader: &mut Reader<'_>) -> Result<Event, DecodeError> {
    let tag = reader.u8()?;
    let event_type = EventType::from_byte(tag).ok_or(DecodeError::UnknownEventType(tag))?;
    let flags = reader.u8()?;

    let chamber = if flags & FLAG_CHAMBER != 0 {
        Some(ChamberId::from_bytes(reader.array()?))
    } else {
        None
    };

    let kind = match event_type {
        EventType::Start => EventKind::Start,
        EventType::Stop => EventKind::Stop,
        EventType::Pause => EventKind::Pause,
        EventType::Resume => EventKind::Resume,
        EventType::Init => EventKind::Init,
        EventType::Exit => EventKind::Exit,
        EventType::CloseSource => EventKind::CloseSource,
        EventType::TaskComplete => EventKind::TaskComplete,
        EventType::Heartbeat => EventKind::Heartbeat,
        EventType::Clear => EventKind::Clear {
            delete_loggers: reader.u8()? != 0,
        },
        EventType::AddTask => {
            let task_type = reader.string()?;
            let count = reader.u32()? as usize;
            let mut bindings = Vec::with_capacity(count.min(reader.remaining()));
            for _ in 0..count {
                bindings.push(read_binding(reader)?);
            }
            let constants = read_metadata(reader)?;
            EventKind::AddTask {
                task_type,
                bindings,
                constants,
            }
        }
        EventType::AddSource => EventKind::AddSource {
            source: SourceId::new(reader.string()?),
            source_type: reader.string()?,
        },
        EventType::RemoveSource => EventKind::RemoveSource {
            source: SourceId::new(reader.string()?),
        },
        EventType::ComponentUpdate => EventKind::ComponentUpdate {
            component: ComponentId::new(reader.string()?),
            value: read_value(reader, 0)?,
        },
        EventType::ComponentWrite => EventKind::ComponentWrite {
            component: ComponentId::new(reader.string()?),
            value: read_value(reader, 0)?,
        },
        EventType::ComponentChanged => EventKind::ComponentChanged {
            component: ComponentId::new(reader.string()?),
            slot: reader.u16()?,
        },
        EventType::ComponentRegister => EventKind::ComponentRegister {
            component: ComponentId::new(reader.string()?),
            kind: read_kind(reader)?,
            address: reader.string()?,
        },
        EventType::ComponentClose => EventKind::ComponentClose {
            component: ComponentId::new(reader.string()?),
        },
        EventType::StateEnter => EventKind::StateEnter {
            state: StateId::from_bytes(reader.array()?),
        },
        EventType::StateExit => EventKind::StateExit {
            state: StateId::from_bytes(reader.array()?),
        },
        EventType::Timeout => EventKind::Timeout {
            name: reader.string()?,
        },
        EventType::Error => {
            let b = reader.u8()?;
            let kind = ErrorKind::from_byte(b).ok_or(DecodeError::UnknownErrorKind(b))?;
            let detail = reader.string()?;
            let source = if reader.u8()? != 0 {
                Some(SourceId::new(reader.string()?))
            } else {
                None
            };
            EventKind::Error {
                kind,
                detail,
                source,
            }
        }
    };

    let metadata = if flags & FLAG_METADATA != 0 {
        read_metadata(reader)?
    } else {
        Metadata::new()
    };

    Ok(Event {
        chamber,
        kind,
        metadata,
    })
}

fn put_count(buf: &mut BytesMut, count: usize) -> Result<(), EncodeError> {
    let count = u32::try_from(count).map_err(|_| EncodeError::CountOverflow(count))?;
    buf.put_u32_le(count);
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    put_bytes(buf, s.as_bytes())
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    if data.len() > MAX_FIELD_LEN {
        return Err(EncodeError::FieldTooLarge {
            len: data.len(),
            max: MAX_FIELD_LEN,
        });
    }
    put_count(buf, data.len())?;
    buf.put_slice(data);
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &Value, depth: usize) -> Result<(), EncodeError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(EncodeError::NestingTooDeep);
    }

    match value {
        Value::Null => buf.put_u8(VALUE_NULL),
        Value::Bool(b) => {
            buf.put_u8(VALUE_BOOL);
            buf.put_u8(*b as u8);
        }
        Value::Int(i) => {
            buf.put_u8(VALUE_INT);
            buf.put_i64_le(*i);
        }
        Value::Float(f) => {
            buf.put_u8(VALUE_FLOAT);
            buf.put_f64_le(*f);
        }
        Value::Text(s) => {
            buf.put_u8(VALUE_TEXT);
            put_str(buf, s)?;
        }
        Value::List(items) => {
            buf.put_u8(VALUE_LIST);
            put_count(buf, items.len())?;
            for item in items {
                put_value(buf, item, depth + 1)?;
            }
        }
        Value::Bytes(data) => {
            buf.put_u8(VALUE_BYTES);
            put_bytes(buf, data)?;
        }
    }
    Ok(())
}

fn put_metadata(buf: &mut BytesMut, metadata: &Metadata) -> Result<(), EncodeError> {
    put_count(buf, metadata.len())?;
    for (key, value) in metadata {
        put_str(buf, key)?;
        put_value(buf, value, 0)?;
    }
    Ok(())
}

fn put_binding(buf: &mut BytesMut, binding: &ComponentBinding) -> Result<(), EncodeError> {
    put_str(buf, &binding.name)?;
    buf.put_u16_le(binding.slot);
    buf.put_u8(binding.kind.to_byte());
    put_str(buf, binding.source.as_str())?;
    put_str(buf, &binding.address)?;
    put_metadata(buf, &binding.metadata)
}

fn read_value(reader: &mut Reader<'_>, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(DecodeError::NestingTooDeep);
    }

    let tag = reader.u8()?;
    let value = match tag {
        VALUE_NULL => Value::Null,
        VALUE_BOOL => Value::Bool(reader.u8()? != 0),
        VALUE_INT => Value::Int(i64::from_le_bytes(reader.array()?)),
        VALUE_FLOAT => Value::Float(f64::from_le_bytes(reader.array()?)),
        VALUE_TEXT => Value::Text(reader.string()?),
        VALUE_LIST => {
            let count = reader.u32()? as usize;
            // Every value takes at least one byte
            if count > reader.remaining() {
                return Err(DecodeError::BufferTooShort {
                    expected: count,
                    actual: reader.remaining(),
                });
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_value(reader, depth + 1)?);
            }
            Value::List(items)
        }
        VALUE_BYTES => Value::Bytes(reader.bytes()?.to_vec()),
        other => return Err(DecodeError::UnknownValueTag(other)),
    };
    Ok(value)
}

fn read_metadata(reader: &mut Reader<'_>) -> Result<Metadata, DecodeError> {
    let count = reader.u32()? as usize;
    let mut metadata = Metadata::new();
    for _ in 0..count {
        let key = reader.string()?;
        let value = read_value(reader, 0)?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

fn read_binding(reader: &mut Reader<'_>) -> Result<ComponentBinding, DecodeError> {
    Ok(ComponentBinding {
        name: reader.string()?,
        slot: reader.u16()?,
        kind: read_kind(reader)?,
        source: SourceId::new(reader.string()?),
        address: reader.string()?,
        metadata: read_metadata(reader)?,
    })
}

fn read_kind(reader: &mut Reader<'_>) -> Result<ComponentKind, DecodeError> {
    let b = reader.u8()?;
    ComponentKind::from_byte(b).ok_or(DecodeError::InvalidComponentKind(b))
}

/// Bounds-checked cursor over an input buffer
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::BufferTooShort {
                expected: n,
                actual: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(DecodeError::FieldTooLarge {
                len,
                max: MAX_FIELD_LEN,
            });
        }
        self.take(len)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let raw = self.bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }
}
