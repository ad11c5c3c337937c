//! Identity rewriting for compiled `AndroidManifest.xml` files.

use crate::core::error::{PatchError, Result};
use crate::core::res::{Chunk, ResValue, ResValueType, ResXmlAttribute, XmlDocument};

pub const MANIFEST_PATH: &str = "AndroidManifest.xml";
pub const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";

#[derive(Clone, Copy, Debug)]
struct Attr {
    name: &'static str,
    id: u32,
}

const LABEL: Attr = Attr {
    name: "label",
    id: 0x0101_0001,
};
const DEBUGGABLE: Attr = Attr {
    name: "debuggable",
    id: 0x0101_000f,
};

enum Value<'a> {
    String(&'a str),
    Boolean(bool),
}

/// The identity an archive's manifest declares.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ManifestInfo {
    pub package: String,
    pub split: Option<String>,
    pub label: Option<String>,
    pub debuggable: Option<bool>,
}

/// Rewrites the base manifest: new package identifier, display name and debuggable flag.
///
/// Returns the input unchanged when it already carries all three.
pub fn patch_manifest(
    bytes: &[u8],
    package_name: &str,
    app_name: &str,
    debuggable: bool,
) -> Result<Vec<u8>> {
    let mut manifest = Manifest::parse(bytes)?;
    let mut changed = manifest.rename_package(package_name);
    let application = manifest.application()?;
    changed |= manifest.set_attribute(application, LABEL, Value::String(app_name));
    changed |= manifest.set_attribute(application, DEBUGGABLE, Value::Boolean(debuggable));
    manifest.finish(bytes, changed)
}

/// Rewrites only the package identifier, for split manifests.
pub fn rename_package(bytes: &[u8], package_name: &str) -> Result<Vec<u8>> {
    let mut manifest = Manifest::parse(bytes)?;
    let changed = manifest.rename_package(package_name);
    manifest.finish(bytes, changed)
}

pub fn inspect(bytes: &[u8]) -> Result<ManifestInfo> {
    let manifest = Manifest::parse(bytes)?;
    let doc = &manifest.doc;
    let string_attr = |node: usize, name: &str| {
        doc.attributes(node)
            .iter()
            .find(|a| doc.string(a.name) == Some(name))
            .and_then(ResXmlAttribute::string_value)
            .and_then(|i| doc.string(i))
            .map(str::to_string)
    };
    let application = doc.elements("application").next();
    let debuggable = application.and_then(|node| {
        doc.attributes(node)
            .iter()
            .find(|a| doc.resource_id(a.name) == Some(DEBUGGABLE.id))
            .filter(|a| a.typed_value.data_type == ResValueType::IntBoolean as u8)
            .map(|a| a.typed_value.data != 0)
    });
    Ok(ManifestInfo {
        package: manifest.package.clone(),
        split: string_attr(manifest.root, "split"),
        label: application.and_then(|node| string_attr(node, LABEL.name)),
        debuggable,
    })
}

fn malformed(msg: impl Into<String>) -> PatchError {
    PatchError::MalformedManifest(msg.into())
}

struct Manifest {
    doc: XmlDocument,
    root: usize,
    package: String,
}

impl Manifest {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let doc = XmlDocument::parse(bytes).map_err(|err| malformed(format!("{err:#}")))?;
        let root = doc
            .elements("manifest")
            .next()
            .ok_or_else(|| malformed("no <manifest> element"))?;
        let package = doc
            .attributes(root)
            .iter()
            .find(|a| doc.string(a.name) == Some("package"))
            .and_then(ResXmlAttribute::string_value)
            .and_then(|i| doc.string(i))
            .ok_or_else(|| malformed("<manifest> declares no package"))?
            .to_string();
        Ok(Self { doc, root, package })
    }

    fn application(&self) -> Result<usize> {
        self.doc
            .elements("application")
            .next()
            .ok_or_else(|| malformed("no <application> element"))
    }

    fn find_attribute(&self, node: usize, attr: Attr) -> Option<usize> {
        self.doc.attributes(node).iter().position(|a| {
            self.doc.resource_id(a.name) == Some(attr.id)
                || (self.doc.string(a.namespace) == Some(ANDROID_NS)
                    && self.doc.string(a.name) == Some(attr.name))
        })
    }

    fn rename_package(&mut self, new: &str) -> bool {
        if self.package == new {
            return false;
        }
        let old = self.package.as_str();
        let mut edits = vec![];
        for (node, chunk) in self.doc.nodes.iter().enumerate() {
            let Chunk::XmlStartElement(_, el, attrs) = chunk else {
                continue;
            };
            let element = self.doc.string(el.name).unwrap_or_default();
            for (i, attr) in attrs.iter().enumerate() {
                let Some(value) = attr.string_value().and_then(|v| self.doc.string(v)) else {
                    continue;
                };
                let name = self.doc.string(attr.name).unwrap_or_default();
                if let Some(rewritten) = rewrite_value(element, name, value, old, new) {
                    tracing::debug!("<{element} {name}> `{value}` -> `{rewritten}`");
                    edits.push((node, i, rewritten));
                }
            }
        }
        for (node, i, value) in &edits {
            let index = self.doc.intern(value);
            if let Some((_, attrs)) = self.doc.element_mut(*node) {
                attrs[*i].raw_value = index;
                attrs[*i].typed_value = ResValue::string(index);
            }
        }
        tracing::debug!("package `{}` -> `{new}`", self.package);
        self.package = new.to_string();
        !edits.is_empty()
    }

    /// Sets `attr` on the element at `node`, inserting it in resource id order when absent.
    fn set_attribute(&mut self, node: usize, attr: Attr, value: Value) -> bool {
        let existing = self.find_attribute(node, attr);
        // Registering a new attribute name renumbers strings, so it goes before any other lookup.
        let name = match existing {
            Some(_) => -1,
            None => self.doc.attribute_name(attr.name, attr.id),
        };
        let (raw_value, typed_value) = match value {
            Value::String(s) => {
                let index = self.doc.intern(s);
                (index, ResValue::string(index))
            }
            Value::Boolean(b) => (-1, ResValue::boolean(b)),
        };
        let namespace = match existing {
            Some(_) => -1,
            None => self.doc.intern(ANDROID_NS),
        };
        let resource_ids: Vec<Option<u32>> = self
            .doc
            .attributes(node)
            .iter()
            .map(|a| self.doc.resource_id(a.name))
            .collect();
        let Some((el, attrs)) = self.doc.element_mut(node) else {
            return false;
        };
        match existing {
            Some(i) => {
                let current = &mut attrs[i];
                if current.raw_value == raw_value && current.typed_value == typed_value {
                    return false;
                }
                current.raw_value = raw_value;
                current.typed_value = typed_value;
            }
            None => {
                let pos = resource_ids
                    .iter()
                    .position(|id| id.map_or(true, |id| id > attr.id))
                    .unwrap_or(attrs.len());
                attrs.insert(
                    pos,
                    ResXmlAttribute {
                        namespace,
                        name,
                        raw_value,
                        typed_value,
                    },
                );
                el.attribute_count = attrs.len() as u16;
                for index in [&mut el.id_index, &mut el.class_index, &mut el.style_index] {
                    if *index as usize > pos {
                        *index += 1;
                    }
                }
            }
        }
        tracing::debug!("set android:{}", attr.name);
        true
    }

    fn finish(self, original: &[u8], changed: bool) -> Result<Vec<u8>> {
        if !changed {
            return Ok(original.to_vec());
        }
        self.doc
            .to_bytes()
            .map_err(|err| malformed(format!("{err:#}")))
    }
}

/// The new value of an attribute after renaming the package `old` to `new`, if it changes.
///
/// Values equal to the package are always replaced. Provider authorities and permission
/// names that extend the package with a `.` suffix follow it. Component class names are
/// left alone since the classes themselves keep their names.
fn rewrite_value(element: &str, attribute: &str, value: &str, old: &str, new: &str) -> Option<String> {
    if value == old {
        return Some(new.to_string());
    }
    let derived = |v: &str| {
        v.strip_prefix(old)
            .filter(|rest| rest.starts_with('.'))
            .map(|rest| format!("{new}{rest}"))
    };
    match attribute {
        "authorities" => {
            let mut changed = false;
            let parts: Vec<String> = value
                .split(';')
                .map(|part| {
                    let rewritten = if part == old {
                        Some(new.to_string())
                    } else {
                        derived(part)
                    };
                    changed |= rewritten.is_some();
                    rewritten.unwrap_or_else(|| part.to_string())
                })
                .collect();
            changed.then(|| parts.join(";"))
        }
        "permission" | "readPermission" | "writePermission" => derived(value),
        "name"
            if matches!(
                element,
                "permission"
                    | "permission-group"
                    | "permission-tree"
                    | "uses-permission"
                    | "uses-permission-sdk-23"
            ) =>
        {
            derived(value)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::manifest;

    fn attribute_values(bytes: &[u8], element: &str) -> Vec<String> {
        let doc = XmlDocument::parse(bytes).unwrap();
        let node = doc.elements(element).next().unwrap();
        doc.attributes(node)
            .iter()
            .filter_map(|a| a.string_value())
            .map(|i| doc.string(i).unwrap().to_string())
            .collect()
    }

    #[test]
    fn patches_identity() {
        let original = manifest("com.example.app", Some("Example"), None);
        let patched = patch_manifest(&original, "com.mod.app", "Modded", false).unwrap();

        let info = inspect(&patched).unwrap();
        assert_eq!(info.package, "com.mod.app");
        assert_eq!(info.label.as_deref(), Some("Modded"));
        assert_eq!(info.debuggable, Some(false));
        assert_eq!(
            attribute_values(&patched, "uses-permission"),
            vec!["com.mod.app.DYNAMIC_RECEIVER_NOT_EXPORTED_PERMISSION"]
        );
        assert_eq!(
            attribute_values(&patched, "provider"),
            vec![
                "androidx.startup.InitializationProvider",
                "com.mod.app.androidx-startup"
            ]
        );
        assert_eq!(
            attribute_values(&patched, "activity"),
            vec!["com.example.app.MainActivity"]
        );
    }

    #[test]
    fn unrelated_attributes_keep_their_values() {
        let original = manifest("com.example.app", Some("Example"), None);
        let patched = patch_manifest(&original, "com.mod.app", "Modded", true).unwrap();
        for element in ["activity", "provider"] {
            let before = XmlDocument::parse(&original).unwrap();
            let after = XmlDocument::parse(&patched).unwrap();
            let (b, a) = (
                before.elements(element).next().unwrap(),
                after.elements(element).next().unwrap(),
            );
            assert_eq!(before.attributes(b).len(), after.attributes(a).len());
        }
        assert_eq!(
            attribute_values(&original, "activity"),
            attribute_values(&patched, "activity")
        );
        assert_eq!(
            attribute_values(&original, "provider")[0],
            attribute_values(&patched, "provider")[0]
        );
    }

    #[test]
    fn inserted_attributes_stay_sorted_by_resource_id() {
        let original = manifest("com.example.app", None, None);
        let patched = patch_manifest(&original, "com.mod.app", "Modded", true).unwrap();

        let doc = XmlDocument::parse(&patched).unwrap();
        let application = doc.elements("application").next().unwrap();
        let ids: Vec<_> = doc
            .attributes(application)
            .iter()
            .map(|a| doc.resource_id(a.name))
            .collect();
        assert_eq!(ids, vec![Some(LABEL.id), Some(DEBUGGABLE.id)]);
        assert_eq!(inspect(&patched).unwrap().debuggable, Some(true));
        // Inserting `debuggable` into the resource map region shifts every other string.
        assert_eq!(
            attribute_values(&patched, "activity"),
            vec!["com.example.app.MainActivity"]
        );
    }

    #[test]
    fn rename_is_idempotent() {
        let split = manifest("com.example.app", None, Some("config.arm64_v8a"));
        let once = rename_package(&split, "com.mod.app").unwrap();
        let twice = rename_package(&once, "com.mod.app").unwrap();
        assert_eq!(once, twice);

        let info = inspect(&once).unwrap();
        assert_eq!(info.package, "com.mod.app");
        assert_eq!(info.split.as_deref(), Some("config.arm64_v8a"));
    }

    #[test]
    fn patching_twice_changes_nothing() {
        let original = manifest("com.example.app", Some("Example"), None);
        let once = patch_manifest(&original, "com.mod.app", "Modded", false).unwrap();
        let twice = patch_manifest(&once, "com.mod.app", "Modded", false).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(
            patch_manifest(b"\x03\x00\x08\x00garbage", "a.b", "c", false),
            Err(PatchError::MalformedManifest(_))
        ));
        assert!(matches!(
            rename_package(&[], "a.b"),
            Err(PatchError::MalformedManifest(_))
        ));
    }

    #[test]
    fn authorities_lists_are_rewritten_per_entry() {
        assert_eq!(
            rewrite_value("provider", "authorities", "a.b.files;other.x;a.b", "a.b", "c.d"),
            Some("c.d.files;other.x;c.d".to_string())
        );
        assert_eq!(
            rewrite_value("provider", "authorities", "a.bc.files", "a.b", "c.d"),
            None
        );
        assert_eq!(rewrite_value("activity", "name", "a.b.Main", "a.b", "c.d"), None);
    }
}
