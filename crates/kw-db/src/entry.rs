use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::group::Icon;
use crate::times::Times;

pub const TITLE: &str = "Title";
pub const USERNAME: &str = "UserName";
pub const PASSWORD: &str = "Password";
pub const URL: &str = "URL";
pub const NOTES: &str = "Notes";

/// Attributes every entry carries, in display order.
pub const STANDARD_ATTRIBUTES: [&str; 5] = [TITLE, USERNAME, PASSWORD, URL, NOTES];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub value: String,
    #[serde(default)]
    pub protected: bool,
}

impl Attribute {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            protected: false,
        }
    }

    pub fn protected(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            protected: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTypeAssociation {
    pub window: String,
    #[serde(default)]
    pub sequence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoType {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub obfuscation: u32,
    #[serde(default)]
    pub default_sequence: String,
    #[serde(default)]
    pub associations: Vec<AutoTypeAssociation>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Default for AutoType {
    fn default() -> Self {
        Self {
            enabled: true,
            obfuscation: 0,
            default_sequence: String::new(),
            associations: Vec::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub uuid: Uuid,
    #[serde(default)]
    pub icon: Icon,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default)]
    pub override_url: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub times: Times,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
    /// Attachment name to content id in the binary pool
    #[serde(default)]
    pub attachments: BTreeMap<String, String>,
    #[serde(default)]
    pub auto_type: AutoType,
    #[serde(default)]
    pub custom_data: BTreeMap<String, String>,
    /// Prior snapshots, newest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Entry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    #[serde(skip)]
    pub(crate) parent: Option<Uuid>,
}

impl Entry {
    pub fn new() -> Self {
        let mut entry = Self {
            uuid: Uuid::new_v4(),
            icon: Icon::default(),
            foreground_color: None,
            background_color: None,
            override_url: String::new(),
            tags: Vec::new(),
            times: Times::now(),
            attributes: BTreeMap::new(),
            attachments: BTreeMap::new(),
            auto_type: AutoType::default(),
            custom_data: BTreeMap::new(),
            history: Vec::new(),
            extra: Map::new(),
            parent: None,
        };
        entry.ensure_standard_attributes();
        entry
    }

    /// Convenience constructor for the common fields.
    pub fn with_login(title: &str, username: &str, password: &str, url: &str) -> Self {
        let mut entry = Self::new();
        entry.set(TITLE, title, false);
        entry.set(USERNAME, username, false);
        entry.set(PASSWORD, password, true);
        entry.set(URL, url, false);
        entry
    }

    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    pub fn get(&self, name: &str) -> &str {
        self.attributes
            .get(name)
            .map(|a| a.value.as_str())
            .unwrap_or("")
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>, protected: bool) {
        self.attributes.insert(
            name.to_string(),
            Attribute {
                value: value.into(),
                protected,
            },
        );
    }

    /// Remove a custom attribute. Standard attributes are reset to empty instead.
    pub fn remove(&mut self, name: &str) {
        if is_standard_attribute(name) {
            if let Some(attr) = self.attributes.get_mut(name) {
                attr.value.clear();
            }
        } else {
            self.attributes.remove(name);
        }
    }

    pub fn title(&self) -> &str {
        self.get(TITLE)
    }

    pub fn username(&self) -> &str {
        self.get(USERNAME)
    }

    pub fn password(&self) -> &str {
        self.get(PASSWORD)
    }

    pub fn url(&self) -> &str {
        self.get(URL)
    }

    pub fn notes(&self) -> &str {
        self.get(NOTES)
    }

    pub fn custom_attributes(&self) -> impl Iterator<Item = (&String, &Attribute)> {
        self.attributes
            .iter()
            .filter(|(name, _)| !is_standard_attribute(name))
    }

    pub(crate) fn ensure_standard_attributes(&mut self) {
        for name in STANDARD_ATTRIBUTES {
            self.attributes
                .entry(name.to_string())
                .or_insert_with(|| Attribute {
                    value: String::new(),
                    protected: name == PASSWORD,
                });
        }
    }

    /// Copy of the current state without history or tree link, as stored in history.
    pub fn snapshot(&self) -> Entry {
        Entry {
            history: Vec::new(),
            parent: None,
            ..self.clone()
        }
    }

    /// Compare user-visible content, ignoring history, tree link and
    /// access bookkeeping.
    pub fn same_content(&self, other: &Entry) -> bool {
        self.uuid == other.uuid
            && self.icon == other.icon
            && self.foreground_color == other.foreground_color
            && self.background_color == other.background_color
            && self.override_url == other.override_url
            && self.tags == other.tags
            && self.times.expires == other.times.expires
            && self.times.expiry == other.times.expiry
            && self.attributes == other.attributes
            && self.attachments == other.attachments
            && self.auto_type == other.auto_type
            && self.custom_data == other.custom_data
            && self.extra == other.extra
    }

    /// Approximate in-memory size used for the history size cap.
    pub(crate) fn approx_size(&self, binary_size: impl Fn(&str) -> usize) -> usize {
        let attrs: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.value.len())
            .sum();
        let custom: usize = self.custom_data.iter().map(|(k, v)| k.len() + v.len()).sum();
        let tags: usize = self.tags.iter().map(String::len).sum();
        let autotype: usize = self.auto_type.default_sequence.len()
            + self
                .auto_type
                .associations
                .iter()
                .map(|a| a.window.len() + a.sequence.len())
                .sum::<usize>();
        let binaries: usize = self
            .attachments
            .iter()
            .map(|(name, id)| name.len() + binary_size(id))
            .sum();
        attrs + custom + tags + autotype + binaries + self.override_url.len()
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_standard_attribute(name: &str) -> bool {
    STANDARD_ATTRIBUTES.contains(&name)
}
