//! Free-form desktop-entry properties.  Keys a service file carries
//! beyond the ones with dedicated fields end up in a property map;
//! service types may declare the expected type of such keys, in
//! which case the raw string is converted when the service is
//! created.

/// A typed property value.
#[derive(Clone, Debug, PartialEq)]
pub enum Property {
    String(String),
    Bool(bool),
    Int(i32),
    Double(f64),
    StringList(Vec<String>),
}

/// The declared type of a property, as found in a service type's
/// `[PropertyDef::<key>]` group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PropertyType {
    String,
    Bool,
    Int,
    Double,
    StringList,
}

impl Property {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Property::String(_) => 1,
            Property::Bool(_) => 2,
            Property::Int(_) => 3,
            Property::Double(_) => 4,
            Property::StringList(_) => 5,
        }
    }

    /// Returns the value as a string slice if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Property::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Property::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl PropertyType {
    /// Parses the type names used in property definitions.  Both the
    /// historical Qt spellings and plain names are accepted.
    pub fn from_name(name: &str) -> Option<PropertyType> {
        match name.trim() {
            "QString" | "string" | "String" => Some(PropertyType::String),
            "bool" | "Bool" => Some(PropertyType::Bool),
            "int" | "Int" => Some(PropertyType::Int),
            "double" | "Double" => Some(PropertyType::Double),
            "QStringList" | "stringlist" | "StringList" => Some(PropertyType::StringList),
            _ => None,
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            PropertyType::String => 1,
            PropertyType::Bool => 2,
            PropertyType::Int => 3,
            PropertyType::Double => 4,
            PropertyType::StringList => 5,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<PropertyType> {
        match tag {
            1 => Some(PropertyType::String),
            2 => Some(PropertyType::Bool),
            3 => Some(PropertyType::Int),
            4 => Some(PropertyType::Double),
            5 => Some(PropertyType::StringList),
            _ => None,
        }
    }

    /// Converts a raw desktop-file value to this type.  Returns `None`
    /// when the value does not parse; callers then keep the string.
    pub fn parse(self, raw: &str) -> Option<Property> {
        let raw = raw.trim();
        match self {
            PropertyType::String => Some(Property::String(raw.to_string())),
            PropertyType::Bool => match raw {
                "true" | "1" => Some(Property::Bool(true)),
                "false" | "0" => Some(Property::Bool(false)),
                _ => None,
            },
            PropertyType::Int => raw.parse().ok().map(Property::Int),
            PropertyType::Double => raw.parse().ok().map(Property::Double),
            PropertyType::StringList => Some(Property::StringList(
                crate::desktop_file::split_list(raw),
            )),
        }
    }
}

#[test]
fn test_parse_typed_values() {
    assert_eq!(PropertyType::from_name("QString"), Some(PropertyType::String));
    assert_eq!(PropertyType::from_name("bogus"), None);

    assert_eq!(PropertyType::Bool.parse("true"), Some(Property::Bool(true)));
    assert_eq!(PropertyType::Bool.parse("maybe"), None);
    assert_eq!(PropertyType::Int.parse(" 42 "), Some(Property::Int(42)));
    assert_eq!(PropertyType::Double.parse("0.5"), Some(Property::Double(0.5)));
    assert_eq!(
        PropertyType::StringList.parse("a;b\\;c;"),
        Some(Property::StringList(vec!["a".into(), "b;c".into()]))
    );

    for ty in [
        PropertyType::String,
        PropertyType::Bool,
        PropertyType::Int,
        PropertyType::Double,
        PropertyType::StringList,
    ] {
        assert_eq!(PropertyType::from_tag(ty.tag()), Some(ty));
    }
}
