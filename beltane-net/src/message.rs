//! Replication message encoding and decoding.
//!
//! Messages are OSC: a slash-separated address whose first segment is the
//! scene name, followed by self-describing typed arguments. A receiver
//! needs no schema knowledge beyond the address.
//!
//! Catalogue:
//! - `/<scene>/triggerOn`   int offset, int id, string voiceType, params...
//! - `/<scene>/triggerOff`  int id
//! - `/<scene>/remove`      int id
//! - `/<scene>/allNotesOff` (no args)
//! - `/<scene>/voice/<id>/<paramAddr>`  one typed value

use rosc::{OscMessage, OscType};

use beltane_types::{ParamValue, TriggerParam, VoiceId};

use crate::error::ProtocolError;

/// A decoded replication event, dispatched with the same switch-on-tag
/// shape as local lifecycle handling.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    TriggerOn {
        offset: u32,
        id: VoiceId,
        voice_type: String,
        params: Vec<ParamValue>,
    },
    TriggerOff {
        id: VoiceId,
    },
    Remove {
        id: VoiceId,
    },
    AllNotesOff,
    Param {
        id: VoiceId,
        addr: String,
        value: ParamValue,
    },
}

fn to_osc(value: &ParamValue) -> OscType {
    match value {
        ParamValue::Int32(v) => OscType::Int(*v),
        ParamValue::Float32(v) => OscType::Float(*v),
        ParamValue::Float64(v) => OscType::Double(*v),
        ParamValue::Str(v) => OscType::String(v.clone()),
    }
}

fn from_osc(arg: &OscType, addr: &str) -> Result<ParamValue, ProtocolError> {
    match arg {
        OscType::Int(v) => Ok(ParamValue::Int32(*v)),
        OscType::Float(v) => Ok(ParamValue::Float32(*v)),
        OscType::Double(v) => Ok(ParamValue::Float64(*v)),
        OscType::String(v) => Ok(ParamValue::Str(v.clone())),
        _ => Err(ProtocolError::UnsupportedType(addr.to_string())),
    }
}

fn int_arg(args: &[OscType], idx: usize, addr: &str) -> Result<i32, ProtocolError> {
    match args.get(idx) {
        Some(OscType::Int(v)) => Ok(*v),
        other => Err(ProtocolError::BadArguments {
            addr: addr.to_string(),
            detail: format!("expected int at position {}, got {:?}", idx, other),
        }),
    }
}

fn id_arg(args: &[OscType], idx: usize, addr: &str) -> Result<VoiceId, ProtocolError> {
    let v = int_arg(args, idx, addr)?;
    if v < 0 {
        return Err(ProtocolError::BadArguments {
            addr: addr.to_string(),
            detail: format!("negative voice id {}", v),
        });
    }
    Ok(VoiceId::new(v as u64))
}

fn string_arg(args: &[OscType], idx: usize, addr: &str) -> Result<String, ProtocolError> {
    match args.get(idx) {
        Some(OscType::String(v)) => Ok(v.clone()),
        other => Err(ProtocolError::BadArguments {
            addr: addr.to_string(),
            detail: format!("expected string at position {}, got {:?}", idx, other),
        }),
    }
}

pub fn encode_trigger_on(
    scene: &str,
    offset: u32,
    id: VoiceId,
    voice_type: &str,
    params: &[TriggerParam],
) -> OscMessage {
    let mut args = vec![
        OscType::Int(offset as i32),
        OscType::Int(id.get() as i32),
        OscType::String(voice_type.to_string()),
    ];
    // Trigger parameters travel as values in declaration order; the
    // receiver maps them back by position.
    args.extend(params.iter().map(|p| to_osc(&p.value)));
    OscMessage {
        addr: format!("/{}/triggerOn", scene),
        args,
    }
}

pub fn encode_trigger_off(scene: &str, id: VoiceId) -> OscMessage {
    OscMessage {
        addr: format!("/{}/triggerOff", scene),
        args: vec![OscType::Int(id.get() as i32)],
    }
}

pub fn encode_remove(scene: &str, id: VoiceId) -> OscMessage {
    OscMessage {
        addr: format!("/{}/remove", scene),
        args: vec![OscType::Int(id.get() as i32)],
    }
}

pub fn encode_all_off(scene: &str) -> OscMessage {
    OscMessage {
        addr: format!("/{}/allNotesOff", scene),
        args: vec![],
    }
}

pub fn encode_param(scene: &str, id: VoiceId, param_addr: &str, value: &ParamValue) -> OscMessage {
    OscMessage {
        addr: format!("/{}/voice/{}/{}", scene, id.get(), param_addr),
        args: vec![to_osc(value)],
    }
}

/// Decode a message addressed to `scene`. Messages for other scenes and
/// malformed messages are errors; the caller drops them and keeps reading.
pub fn decode_event(scene: &str, msg: &OscMessage) -> Result<ReplicationEvent, ProtocolError> {
    let addr = msg.addr.as_str();
    let mut segments = addr.split('/');
    if segments.next() != Some("") {
        return Err(ProtocolError::Malformed(format!(
            "address must start with '/': {}",
            addr
        )));
    }
    if segments.next() != Some(scene) {
        return Err(ProtocolError::WrongScene {
            scene: scene.to_string(),
            addr: addr.to_string(),
        });
    }

    let rest: Vec<&str> = segments.collect();
    match rest.as_slice() {
        ["triggerOn"] => {
            let offset = int_arg(&msg.args, 0, addr)?;
            let id = id_arg(&msg.args, 1, addr)?;
            let voice_type = string_arg(&msg.args, 2, addr)?;
            let params = msg.args[3..]
                .iter()
                .map(|a| from_osc(a, addr))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ReplicationEvent::TriggerOn {
                offset: offset.max(0) as u32,
                id,
                voice_type,
                params,
            })
        }
        ["triggerOff"] => Ok(ReplicationEvent::TriggerOff {
            id: id_arg(&msg.args, 0, addr)?,
        }),
        ["remove"] => Ok(ReplicationEvent::Remove {
            id: id_arg(&msg.args, 0, addr)?,
        }),
        ["allNotesOff"] => Ok(ReplicationEvent::AllNotesOff),
        ["voice", id, param @ ..] if !param.is_empty() => {
            let id: u64 = id.parse().map_err(|_| ProtocolError::BadArguments {
                addr: addr.to_string(),
                detail: format!("voice id '{}' is not a number", id),
            })?;
            let value = msg
                .args
                .first()
                .ok_or_else(|| ProtocolError::BadArguments {
                    addr: addr.to_string(),
                    detail: "parameter message carries no value".to_string(),
                })
                .and_then(|a| from_osc(a, addr))?;
            Ok(ReplicationEvent::Param {
                id: VoiceId::new(id),
                addr: param.join("/"),
                value,
            })
        }
        _ => Err(ProtocolError::UnknownAddress(addr.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_on_roundtrip() {
        let params = vec![
            TriggerParam::new("freq", 440.0f32),
            TriggerParam::new("label", "bell"),
        ];
        let msg = encode_trigger_on("scene", 16, VoiceId::new(7), "Tone", &params);
        assert_eq!(msg.addr, "/scene/triggerOn");

        let event = decode_event("scene", &msg).unwrap();
        assert_eq!(
            event,
            ReplicationEvent::TriggerOn {
                offset: 16,
                id: VoiceId::new(7),
                voice_type: "Tone".to_string(),
                params: vec![
                    ParamValue::Float32(440.0),
                    ParamValue::Str("bell".to_string())
                ],
            }
        );
    }

    #[test]
    fn param_address_allows_nested_segments() {
        let msg = encode_param(
            "scene",
            VoiceId::new(3),
            "filter/cutoff",
            &ParamValue::Float64(1200.0),
        );
        assert_eq!(msg.addr, "/scene/voice/3/filter/cutoff");

        let event = decode_event("scene", &msg).unwrap();
        assert_eq!(
            event,
            ReplicationEvent::Param {
                id: VoiceId::new(3),
                addr: "filter/cutoff".to_string(),
                value: ParamValue::Float64(1200.0),
            }
        );
    }

    #[test]
    fn wrong_scene_is_rejected() {
        let msg = encode_all_off("other");
        assert!(matches!(
            decode_event("scene", &msg),
            Err(ProtocolError::WrongScene { .. })
        ));
    }

    #[test]
    fn missing_args_are_bad_arguments() {
        let msg = OscMessage {
            addr: "/scene/triggerOff".to_string(),
            args: vec![],
        };
        assert!(matches!(
            decode_event("scene", &msg),
            Err(ProtocolError::BadArguments { .. })
        ));
    }

    #[test]
    fn negative_wire_ids_are_rejected() {
        for addr in ["/scene/triggerOff", "/scene/remove"] {
            let msg = OscMessage {
                addr: addr.to_string(),
                args: vec![OscType::Int(-3)],
            };
            assert!(matches!(
                decode_event("scene", &msg),
                Err(ProtocolError::BadArguments { .. })
            ));
        }

        let on = OscMessage {
            addr: "/scene/triggerOn".to_string(),
            args: vec![
                OscType::Int(0),
                OscType::Int(-1),
                OscType::String("Tone".to_string()),
            ],
        };
        assert!(matches!(
            decode_event("scene", &on),
            Err(ProtocolError::BadArguments { .. })
        ));
    }

    #[test]
    fn unknown_address_is_rejected() {
        let msg = OscMessage {
            addr: "/scene/bogus".to_string(),
            args: vec![],
        };
        assert!(matches!(
            decode_event("scene", &msg),
            Err(ProtocolError::UnknownAddress(_))
        ));
    }

    #[test]
    fn all_off_and_lifecycle_addresses() {
        assert_eq!(
            decode_event("s", &encode_all_off("s")).unwrap(),
            ReplicationEvent::AllNotesOff
        );
        assert_eq!(
            decode_event("s", &encode_trigger_off("s", VoiceId::new(9))).unwrap(),
            ReplicationEvent::TriggerOff { id: VoiceId::new(9) }
        );
        assert_eq!(
            decode_event("s", &encode_remove("s", VoiceId::new(9))).unwrap(),
            ReplicationEvent::Remove { id: VoiceId::new(9) }
        );
    }
}
