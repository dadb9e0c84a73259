use serde::{Deserialize, Serialize};

pub const DEFAULT_MANUFACTURER: &str = "Android";
pub const DEFAULT_MODEL: &str = "Accessory Host Demo";
pub const DEFAULT_DESCRIPTION: &str = "AOA host demo application";
pub const DEFAULT_VERSION: &str = "1.0";
pub const DEFAULT_URI: &str = "http://www.android.com/";
pub const DEFAULT_SERIAL: &str = "0000000012345678";

/// One of the identification strings sent with `SEND_STRING`. The
/// discriminant is the control transfer index the device expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StringField {
    Manufacturer = 0,
    Model = 1,
    Description = 2,
    Version = 3,
    Uri = 4,
    Serial = 5,
}

impl StringField {
    /// All fields, in the order they are sent.
    pub const ALL: [StringField; 6] = [
        StringField::Manufacturer,
        StringField::Model,
        StringField::Description,
        StringField::Version,
        StringField::Uri,
        StringField::Serial,
    ];

    pub fn index(self) -> u16 {
        self as u16
    }
}

/// The strings the host identifies itself with while asking a device to
/// switch into accessory mode. The device uses them to pick an application
/// to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessoryDescriptor {
    pub manufacturer: String,
    pub model: String,
    pub description: String,
    pub version: String,
    pub uri: String,
    pub serial: String,
}

impl AccessoryDescriptor {
    pub fn get(&self, field: StringField) -> &str {
        match field {
            StringField::Manufacturer => &self.manufacturer,
            StringField::Model => &self.model,
            StringField::Description => &self.description,
            StringField::Version => &self.version,
            StringField::Uri => &self.uri,
            StringField::Serial => &self.serial,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (StringField, &str)> {
        StringField::ALL
            .into_iter()
            .map(move |field| (field, self.get(field)))
    }
}

impl Default for AccessoryDescriptor {
    fn default() -> Self {
        Self {
            manufacturer: DEFAULT_MANUFACTURER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            version: DEFAULT_VERSION.to_string(),
            uri: DEFAULT_URI.to_string(),
            serial: DEFAULT_SERIAL.to_string(),
        }
    }
}
