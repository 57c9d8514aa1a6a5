use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::times::Times;

/// Standard icon index used for new groups (folder)
pub const FOLDER_ICON: u32 = 48;

/// Standard icon index used for the recycle bin
pub const RECYCLE_BIN_ICON: u32 = 43;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Icon {
    Standard(u32),
    Custom(Uuid),
}

impl Default for Icon {
    fn default() -> Self {
        Icon::Standard(0)
    }
}

/// Inherit / on / off switch for group behaviour flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    #[default]
    Inherit,
    Enable,
    Disable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub icon: Icon,
    #[serde(default)]
    pub times: Times,
    #[serde(default)]
    pub is_expanded: bool,
    #[serde(default)]
    pub default_autotype_sequence: String,
    #[serde(default)]
    pub enable_autotype: TriState,
    #[serde(default)]
    pub enable_searching: TriState,
    #[serde(default)]
    pub custom_data: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    #[serde(skip)]
    pub(crate) parent: Option<Uuid>,
    #[serde(skip)]
    pub(crate) groups: Vec<Uuid>,
    #[serde(skip)]
    pub(crate) entries: Vec<Uuid>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            notes: String::new(),
            icon: Icon::Standard(FOLDER_ICON),
            times: Times::now(),
            is_expanded: true,
            default_autotype_sequence: String::new(),
            enable_autotype: TriState::Inherit,
            enable_searching: TriState::Inherit,
            custom_data: BTreeMap::new(),
            extra: Map::new(),
            parent: None,
            groups: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    /// Ordered sub-group ids.
    pub fn group_ids(&self) -> &[Uuid] {
        &self.groups
    }

    /// Ordered entry ids.
    pub fn entry_ids(&self) -> &[Uuid] {
        &self.entries
    }

    /// Compare everything the user can edit, ignoring tree links and times.
    pub fn same_properties(&self, other: &Group) -> bool {
        self.name == other.name
            && self.notes == other.notes
            && self.icon == other.icon
            && self.times.expires == other.times.expires
            && self.times.expiry == other.times.expiry
            && self.is_expanded == other.is_expanded
            && self.default_autotype_sequence == other.default_autotype_sequence
            && self.enable_autotype == other.enable_autotype
            && self.enable_searching == other.enable_searching
            && self.custom_data == other.custom_data
            && self.extra == other.extra
    }

    /// Copy of the editable properties with tree links cleared.
    pub(crate) fn detached(&self) -> Group {
        Group {
            parent: None,
            groups: Vec::new(),
            entries: Vec::new(),
            ..self.clone()
        }
    }
}
