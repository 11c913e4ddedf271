//! Action Schema: parses a service's SCPD document into action and
//! state-variable descriptors, and formats per-argument SOAP XML from
//! them.

use std::collections::HashMap;
use std::io::Cursor;

use xml::reader::XmlEvent;
use xml::EventReader;

use crate::error::{DlnaError, Result};
use crate::model::VolumeRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: String,
    pub direction: Direction,
    pub related_state_variable: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub name: String,
    pub arguments: Vec<Argument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateVariable {
    pub name: String,
    pub data_type: String,
    pub allowed_values: Vec<String>,
    pub allowed_value_range: Option<(String, String)>,
}

impl StateVariable {
    /// Returns the enumerated value matching `candidate` case-insensitively.
    pub fn matching_allowed_value(&self, candidate: &str) -> Option<&str> {
        self.allowed_values
            .iter()
            .find(|v| v.eq_ignore_ascii_case(candidate))
            .map(String::as_str)
    }
}

/// One service's action list and state-variable table, parsed lazily
/// from SCPD on first use.
#[derive(Debug, Clone, Default)]
pub struct ActionSchema {
    actions: HashMap<String, Action>,
    state_variables: HashMap<String, StateVariable>,
}

impl ActionSchema {
    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn state_variable(&self, name: &str) -> Option<&StateVariable> {
        self.state_variables.get(name)
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Extracts the `Volume` state variable's allowed range, if the
    /// service's schema declares one.
    pub fn volume_range(&self) -> Option<VolumeRange> {
        let var = self.state_variables.get("Volume")?;
        let (min, max) = var.allowed_value_range.as_ref()?;
        Some(VolumeRange {
            min: min.parse().ok()?,
            max: max.parse().ok()?,
        })
    }

    /// Parses an SCPD XML document into action and state-variable tables.
    pub fn parse_scpd(xml: &str) -> Result<Self> {
        let reader = EventReader::new(Cursor::new(xml.as_bytes()));
        let mut actions = HashMap::new();
        let mut state_variables = HashMap::new();

        let mut path: Vec<String> = Vec::new();
        let mut current_action: Option<Action> = None;
        let mut current_argument: Option<Argument> = None;
        let mut current_variable: Option<StateVariable> = None;
        let mut range_min: Option<String> = None;
        let mut range_max: Option<String> = None;
        let mut text = String::new();

        for event in reader {
            match event.map_err(|e| DlnaError::MalformedXml(e.to_string()))? {
                XmlEvent::StartElement { name, .. } => {
                    let local = name.local_name;
                    path.push(local.clone());
                    text.clear();
                    match local.as_str() {
                        "action" => current_action = Some(Action {
                            name: String::new(),
                            arguments: Vec::new(),
                        }),
                        "argument" => current_argument = Some(Argument {
                            name: String::new(),
                            direction: Direction::In,
                            related_state_variable: String::new(),
                        }),
                        "stateVariable" => current_variable = Some(StateVariable::default()),
                        _ => {}
                    }
                }
                XmlEvent::Characters(chars) | XmlEvent::CData(chars) => {
                    text.push_str(&chars);
                }
                XmlEvent::EndElement { .. } => {
                    let local = path.pop().unwrap_or_default();
                    let value = text.trim().to_string();
                    text.clear();

                    match local.as_str() {
                        "name" => {
                            if path.last().map(String::as_str) == Some("argument") {
                                if let Some(arg) = current_argument.as_mut() {
                                    arg.name = value;
                                }
                            } else if path.last().map(String::as_str) == Some("action") {
                                if let Some(action) = current_action.as_mut() {
                                    action.name = value;
                                }
                            } else if path.last().map(String::as_str) == Some("stateVariable") {
                                if let Some(var) = current_variable.as_mut() {
                                    var.name = value;
                                }
                            }
                        }
                        "direction" => {
                            if let Some(arg) = current_argument.as_mut() {
                                arg.direction = if value.eq_ignore_ascii_case("out") {
                                    Direction::Out
                                } else {
                                    Direction::In
                                };
                            }
                        }
                        "relatedStateVariable" => {
                            if let Some(arg) = current_argument.as_mut() {
                                arg.related_state_variable = value;
                            }
                        }
                        "dataType" => {
                            if let Some(var) = current_variable.as_mut() {
                                var.data_type = value;
                            }
                        }
                        "allowedValue" => {
                            if let Some(var) = current_variable.as_mut() {
                                var.allowed_values.push(value);
                            }
                        }
                        "minimum" => range_min = Some(value),
                        "maximum" => range_max = Some(value),
                        "argument" => {
                            if let (Some(action), Some(argument)) =
                                (current_action.as_mut(), current_argument.take())
                            {
                                action.arguments.push(argument);
                            }
                        }
                        "action" => {
                            if let Some(action) = current_action.take() {
                                actions.insert(action.name.clone(), action);
                            }
                        }
                        "allowedValueRange" => {
                            if let Some(var) = current_variable.as_mut() {
                                if let (Some(min), Some(max)) = (range_min.take(), range_max.take()) {
                                    var.allowed_value_range = Some((min, max));
                                }
                            }
                        }
                        "stateVariable" => {
                            if let Some(var) = current_variable.take() {
                                state_variables.insert(var.name.clone(), var);
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            actions,
            state_variables,
        })
    }
}

/// Builds the SOAP argument XML for one action argument. `InstanceID` is
/// always emitted as `0`. Enumerated state variables prefer a
/// case-insensitive match of `command_param`, falling back to their first
/// allowed value; unenumerated ones send `value` verbatim.
pub fn build_argument_xml(
    schema: &ActionSchema,
    arg: &Argument,
    value: &str,
    command_param: Option<&str>,
) -> String {
    if arg.name == "InstanceID" {
        return "<InstanceID>0</InstanceID>".to_string();
    }

    let resolved_value = schema
        .state_variable(&arg.related_state_variable)
        .and_then(|var| {
            if var.allowed_values.is_empty() {
                None
            } else if let Some(candidate) = command_param {
                var.matching_allowed_value(candidate)
                    .map(str::to_string)
                    .or_else(|| var.allowed_values.first().cloned())
            } else {
                var.allowed_values.first().cloned()
            }
        })
        .unwrap_or_else(|| value.to_string());

    match schema.state_variable(&arg.related_state_variable) {
        Some(var) if !var.data_type.is_empty() => format!(
            r#"<{name} xmlns:dt="urn:schemas-microsoft-com:datatypes" dt:dt="{data_type}">{value}</{name}>"#,
            name = arg.name,
            data_type = var.data_type,
            value = resolved_value,
        ),
        _ => format!("<{name}>{value}</{name}>", name = arg.name, value = resolved_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCPD: &str = r#"<?xml version="1.0"?>
        <scpd xmlns="urn:schemas-upnp-org:service-1-0">
            <actionList>
                <action>
                    <name>SetVolume</name>
                    <argumentList>
                        <argument>
                            <name>InstanceID</name>
                            <direction>in</direction>
                            <relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable>
                        </argument>
                        <argument>
                            <name>Channel</name>
                            <direction>in</direction>
                            <relatedStateVariable>A_ARG_TYPE_Channel</relatedStateVariable>
                        </argument>
                        <argument>
                            <name>DesiredVolume</name>
                            <direction>in</direction>
                            <relatedStateVariable>Volume</relatedStateVariable>
                        </argument>
                    </argumentList>
                </action>
            </actionList>
            <serviceStateTable>
                <stateVariable sendEvents="yes">
                    <name>Volume</name>
                    <dataType>ui2</dataType>
                    <allowedValueRange>
                        <minimum>0</minimum>
                        <maximum>100</maximum>
                    </allowedValueRange>
                </stateVariable>
                <stateVariable sendEvents="no">
                    <name>A_ARG_TYPE_Channel</name>
                    <dataType>string</dataType>
                    <allowedValueList>
                        <allowedValue>Master</allowedValue>
                        <allowedValue>LF</allowedValue>
                    </allowedValueList>
                </stateVariable>
            </serviceStateTable>
        </scpd>"#;

    #[test]
    fn test_parse_scpd_action_and_arguments() {
        let schema = ActionSchema::parse_scpd(SCPD).unwrap();

        let action = schema.action("SetVolume").unwrap();
        assert_eq!(3, action.arguments.len());
        assert_eq!("DesiredVolume", action.arguments[2].name);
        assert_eq!(Direction::In, action.arguments[2].direction);
    }

    #[test]
    fn test_parse_scpd_state_variable_range() {
        let schema = ActionSchema::parse_scpd(SCPD).unwrap();
        let range = schema.volume_range().unwrap();
        assert_eq!(0, range.min);
        assert_eq!(100, range.max);
    }

    #[test]
    fn test_build_argument_xml_instance_id() {
        let schema = ActionSchema::parse_scpd(SCPD).unwrap();
        let arg = schema.action("SetVolume").unwrap().arguments[0].clone();

        let xml = build_argument_xml(&schema, &arg, "0", None);

        assert_eq!("<InstanceID>0</InstanceID>", xml);
    }

    #[test]
    fn test_build_argument_xml_enumerated_case_insensitive_match() {
        let schema = ActionSchema::parse_scpd(SCPD).unwrap();
        let arg = schema.action("SetVolume").unwrap().arguments[1].clone();

        let xml = build_argument_xml(&schema, &arg, "master", Some("master"));

        assert!(xml.contains("Master"));
    }

    #[test]
    fn test_build_argument_xml_typed_value() {
        let schema = ActionSchema::parse_scpd(SCPD).unwrap();
        let arg = schema.action("SetVolume").unwrap().arguments[2].clone();

        let xml = build_argument_xml(&schema, &arg, "40", None);

        assert_eq!(
            r#"<DesiredVolume xmlns:dt="urn:schemas-microsoft-com:datatypes" dt:dt="ui2">40</DesiredVolume>"#,
            xml
        );
    }

    #[test]
    fn test_build_argument_xml_unknown_variable_no_type_annotation() {
        let schema = ActionSchema::default();
        let arg = Argument {
            name: "Foo".to_string(),
            direction: Direction::In,
            related_state_variable: "Unknown".to_string(),
        };

        let xml = build_argument_xml(&schema, &arg, "bar", None);

        assert_eq!("<Foo>bar</Foo>", xml);
    }
}
