//! Checked GObject property access on encoder elements.
//!
//! Encoder plugins disagree on property names, types and enum vocabularies.
//! Every setter here looks the property up first and returns `false` instead
//! of letting glib panic on a missing property, a mistyped value or an
//! unknown enum nick.

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use tracing::trace;

pub fn has(element: &gst::Element, name: &str) -> bool {
    element.find_property(name).is_some()
}

/// Set an integer-valued property, clamped to the property's declared range.
pub fn set_number(element: &gst::Element, name: &str, value: i64) -> bool {
    let Some(pspec) = element.find_property(name) else {
        return false;
    };
    let ty = pspec.value_type();
    let v: glib::Value = if let Some(p) = pspec.downcast_ref::<glib::ParamSpecUInt>() {
        (value.clamp(p.minimum() as i64, p.maximum() as i64) as u32).to_value()
    } else if let Some(p) = pspec.downcast_ref::<glib::ParamSpecInt>() {
        (value.clamp(p.minimum() as i64, p.maximum() as i64) as i32).to_value()
    } else if let Some(p) = pspec.downcast_ref::<glib::ParamSpecUInt64>() {
        (value.max(0) as u64).clamp(p.minimum(), p.maximum()).to_value()
    } else if let Some(p) = pspec.downcast_ref::<glib::ParamSpecInt64>() {
        value.clamp(p.minimum(), p.maximum()).to_value()
    } else if let Some(p) = pspec.downcast_ref::<glib::ParamSpecDouble>() {
        (value as f64).clamp(p.minimum(), p.maximum()).to_value()
    } else if let Some(p) = pspec.downcast_ref::<glib::ParamSpecFloat>() {
        (value as f32).clamp(p.minimum(), p.maximum()).to_value()
    } else {
        trace!("{}: property '{}' is {}, not numeric", element.name(), name, ty);
        return false;
    };
    element.set_property_from_value(name, &v);
    true
}

/// Set a floating point property, clamped to its range.
pub fn set_float(element: &gst::Element, name: &str, value: f64) -> bool {
    let Some(pspec) = element.find_property(name) else {
        return false;
    };
    let v: glib::Value = if let Some(p) = pspec.downcast_ref::<glib::ParamSpecDouble>() {
        value.clamp(p.minimum(), p.maximum()).to_value()
    } else if let Some(p) = pspec.downcast_ref::<glib::ParamSpecFloat>() {
        (value as f32).clamp(p.minimum(), p.maximum()).to_value()
    } else {
        return false;
    };
    element.set_property_from_value(name, &v);
    true
}

pub fn set_bool(element: &gst::Element, name: &str, value: bool) -> bool {
    match element.find_property(name) {
        Some(pspec) if pspec.value_type() == glib::Type::BOOL => {
            element.set_property(name, value);
            true
        }
        _ => false,
    }
}

pub fn set_string(element: &gst::Element, name: &str, value: &str) -> bool {
    match element.find_property(name) {
        Some(pspec) if pspec.value_type() == glib::Type::STRING => {
            element.set_property(name, value);
            true
        }
        _ => false,
    }
}

/// Set an enum property by nick, or a flags property from `nick+nick`.
pub fn set_nick(element: &gst::Element, name: &str, nick: &str) -> bool {
    let Some(pspec) = element.find_property(name) else {
        return false;
    };
    let ty = pspec.value_type();
    let known = if ty.is_a(glib::Type::ENUM) {
        glib::EnumClass::with_type(ty).map_or(false, |class| class.value_by_nick(nick).is_some())
    } else if ty.is_a(glib::Type::FLAGS) {
        glib::FlagsClass::with_type(ty).map_or(false, |class| {
            nick.split('+').all(|part| class.value_by_nick(part).is_some())
        })
    } else {
        false
    };
    if !known {
        trace!("{}: '{}' has no value '{}'", element.name(), name, nick);
        return false;
    }
    element.set_property_from_str(name, nick);
    true
}

/// First nick from `nicks` the property accepts.
pub fn set_first_nick<'a>(element: &gst::Element, name: &str, nicks: &[&'a str]) -> Option<&'a str> {
    nicks.iter().copied().find(|nick| set_nick(element, name, nick))
}

/// Current value rendered as text. Enums render as their nick.
pub fn get(element: &gst::Element, name: &str) -> Option<String> {
    let pspec = element.find_property(name)?;
    let ty = pspec.value_type();
    let value = element.property_value(name);

    if ty.is_a(glib::Type::ENUM) {
        return glib::EnumValue::from_value(&value).map(|(_, v)| v.nick().to_string());
    }
    match ty {
        glib::Type::STRING => value.get::<Option<String>>().ok().flatten(),
        glib::Type::BOOL => value.get::<bool>().ok().map(|v| v.to_string()),
        glib::Type::U32 => value.get::<u32>().ok().map(|v| v.to_string()),
        glib::Type::I32 => value.get::<i32>().ok().map(|v| v.to_string()),
        glib::Type::U64 => value.get::<u64>().ok().map(|v| v.to_string()),
        glib::Type::I64 => value.get::<i64>().ok().map(|v| v.to_string()),
        glib::Type::F64 => value.get::<f64>().ok().map(|v| v.to_string()),
        glib::Type::F32 => value.get::<f32>().ok().map(|v| v.to_string()),
        _ => value.serialize().ok().map(|s| s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(factory: &str) -> Option<gst::Element> {
        gst::init().ok()?;
        gst::ElementFactory::make(factory).build().ok()
    }

    #[test]
    fn missing_properties_are_reported_not_panicked() {
        let Some(queue) = element("queue") else {
            eprintln!("GStreamer unavailable, skipping");
            return;
        };
        assert!(!has(&queue, "no-such-property"));
        assert!(!set_number(&queue, "no-such-property", 1));
        assert!(!set_nick(&queue, "no-such-property", "x"));
        assert!(get(&queue, "no-such-property").is_none());
    }

    #[test]
    fn numbers_are_clamped_and_enums_checked() {
        let Some(queue) = element("queue") else {
            eprintln!("GStreamer unavailable, skipping");
            return;
        };
        // max-size-buffers is a uint
        assert!(set_number(&queue, "max-size-buffers", -5));
        assert_eq!(get(&queue, "max-size-buffers").as_deref(), Some("0"));
        assert!(set_number(&queue, "max-size-buffers", 7));
        assert_eq!(get(&queue, "max-size-buffers").as_deref(), Some("7"));

        // leaky is an enum: no / upstream / downstream
        assert!(!set_nick(&queue, "leaky", "sideways"));
        assert!(set_nick(&queue, "leaky", "downstream"));
        assert_eq!(get(&queue, "leaky").as_deref(), Some("downstream"));
        assert_eq!(set_first_nick(&queue, "leaky", &["bogus", "upstream"]), Some("upstream"));

        // A bool property does not take numbers
        assert!(!set_number(&queue, "silent", 1));
        assert!(set_bool(&queue, "silent", true));
        assert_eq!(get(&queue, "silent").as_deref(), Some("true"));
    }
}
