//! Recording template descriptor and answer validation
//!
//! Templates are questionnaires filled in before or during a recording. The
//! device gates `recording:start` and `recording:stop_and_save` on the
//! template being completely and validly answered, so the client validates
//! answers locally before posting them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Widget kinds a template item can render as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WidgetType {
    /// Single-line text entry
    Text,
    /// Multi-line text entry
    Paragraph,
    /// Single choice from `choices`
    RadioList,
    /// Multiple choices from `choices`
    CheckboxList,
    /// Non-input section heading
    SectionHeader,
    /// Non-input page separator
    PageBreak,
}

impl WidgetType {
    /// Whether this widget collects an answer at all
    pub fn is_input(&self) -> bool {
        !matches!(self, WidgetType::SectionHeader | WidgetType::PageBreak)
    }
}

/// Value constraint applied to free-text answers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    /// Any string
    #[default]
    Any,
    /// Must parse as an integer
    Integer,
    /// Must parse as a floating point number
    Float,
}

/// One item (question, heading, or separator) of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateItem {
    /// Item identifier; keys the answer map
    pub id: String,
    /// Displayed label
    #[serde(default)]
    pub title: String,
    /// Widget kind
    pub widget_type: WidgetType,
    /// Value constraint for text answers
    #[serde(default)]
    pub input_type: InputType,
    /// Whether an answer is mandatory
    #[serde(default)]
    pub required: bool,
    /// Allowed values for radio and checkbox widgets
    #[serde(default)]
    pub choices: Vec<String>,
    /// Help text shown below the widget
    #[serde(default)]
    pub help_text: String,
    /// Whether the item is hidden from the wearer
    #[serde(default)]
    pub hidden: bool,
}

/// A validation failure for a single template item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateItemError {
    /// Identifier of the offending item
    pub item_id: String,
    /// Item label, for display
    pub title: String,
    /// What went wrong
    pub message: String,
}

/// Answer map: item id to the selected/entered values (multi-select preserved)
pub type TemplateResponses = BTreeMap<String, Vec<String>>;

/// The questionnaire currently selected on the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Template identifier
    pub id: String,
    /// Template name
    #[serde(default)]
    pub name: String,
    /// Items in display order
    #[serde(default)]
    pub items: Vec<TemplateItem>,
    /// Format fragments composed into the recording name
    #[serde(default)]
    pub recording_name_format: Vec<String>,
    /// Creation timestamp, as reported by the device
    #[serde(default)]
    pub created_at: Option<String>,
    /// Publication timestamp, as reported by the device
    #[serde(default)]
    pub published_at: Option<String>,
}

impl Template {
    /// Look up an item by id
    pub fn item(&self, item_id: &str) -> Option<&TemplateItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    /// Validate an answer map against this template
    ///
    /// Returns one [`TemplateItemError`] per offending item: a required item
    /// with no non-empty answer, a choice-widget answer outside `choices`, or
    /// a text answer violating the item's input type.
    pub fn validate(&self, responses: &TemplateResponses) -> Result<(), Vec<TemplateItemError>> {
        let mut errors = Vec::new();

        for item in self.items.iter().filter(|i| i.widget_type.is_input()) {
            let answers: &[String] = responses.get(&item.id).map(Vec::as_slice).unwrap_or(&[]);
            let non_empty: Vec<&String> = answers.iter().filter(|a| !a.is_empty()).collect();

            if item.required && non_empty.is_empty() {
                errors.push(TemplateItemError {
                    item_id: item.id.clone(),
                    title: item.title.clone(),
                    message: "required item has no answer".to_string(),
                });
                continue;
            }

            match item.widget_type {
                WidgetType::RadioList | WidgetType::CheckboxList => {
                    for answer in &non_empty {
                        if !item.choices.iter().any(|c| c == *answer) {
                            errors.push(TemplateItemError {
                                item_id: item.id.clone(),
                                title: item.title.clone(),
                                message: format!("'{answer}' is not one of the allowed values"),
                            });
                        }
                    }
                    if item.widget_type == WidgetType::RadioList && non_empty.len() > 1 {
                        errors.push(TemplateItemError {
                            item_id: item.id.clone(),
                            title: item.title.clone(),
                            message: "radio items accept a single answer".to_string(),
                        });
                    }
                }
                _ => {
                    for answer in &non_empty {
                        let ok = match item.input_type {
                            InputType::Any => true,
                            InputType::Integer => answer.parse::<i64>().is_ok(),
                            InputType::Float => answer.parse::<f64>().is_ok(),
                        };
                        if !ok {
                            errors.push(TemplateItemError {
                                item_id: item.id.clone(),
                                title: item.title.clone(),
                                message: format!(
                                    "'{answer}' does not satisfy the {:?} constraint",
                                    item.input_type
                                ),
                            });
                        }
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
