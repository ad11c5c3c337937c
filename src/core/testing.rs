//! Fixture builders shared by the unit tests.

use crate::core::archive::ZipFileOptions;
use crate::core::manifest::ANDROID_NS;
use crate::core::res::{
    Chunk, ResValue, ResXmlAttribute, ResXmlEndElement, ResXmlNamespace, ResXmlNodeHeader,
    ResXmlStartElement, StringPool, XmlDocument,
};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::ZipWriter;

pub fn write_zip(path: &Path, entries: &[(&str, &[u8], ZipFileOptions)]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    for (name, contents, opts) in entries {
        zip.start_file_aligned(*name, opts.file_options(), opts.alignment())
            .unwrap();
        zip.write_all(contents).unwrap();
    }
    zip.finish().unwrap();
}

fn string_attr(doc: &mut XmlDocument, namespace: i32, name: i32, value: &str) -> ResXmlAttribute {
    let value = doc.intern(value);
    ResXmlAttribute {
        namespace,
        name,
        raw_value: value,
        typed_value: ResValue::string(value),
    }
}

fn start(doc: &mut XmlDocument, name: &str, attributes: Vec<ResXmlAttribute>) -> Chunk {
    let name = doc.intern(name);
    Chunk::XmlStartElement(
        ResXmlNodeHeader::default(),
        ResXmlStartElement {
            name,
            attribute_count: attributes.len() as u16,
            ..Default::default()
        },
        attributes,
    )
}

fn end(doc: &mut XmlDocument, name: &str) -> Chunk {
    let name = doc.intern(name);
    Chunk::XmlEndElement(
        ResXmlNodeHeader::default(),
        ResXmlEndElement {
            namespace: -1,
            name,
        },
    )
}

/// A compiled manifest shaped like the ones aapt2 emits: a permission derived from the
/// package, an application with a startup provider and a launcher activity.
pub fn manifest(package: &str, label: Option<&str>, split: Option<&str>) -> Vec<u8> {
    let mut doc = XmlDocument {
        strings: StringPool::new(false),
        ..Default::default()
    };
    let label_attr = doc.attribute_name("label", 0x0101_0001);
    let name_attr = doc.attribute_name("name", 0x0101_0003);
    let authorities_attr = doc.attribute_name("authorities", 0x0101_0018);
    let prefix = doc.intern("android");
    let android = doc.intern(ANDROID_NS);
    let package_attr = doc.intern("package");
    let split_attr = doc.intern("split");
    let namespace = ResXmlNamespace {
        prefix,
        uri: android,
    };

    let mut manifest_attrs = vec![string_attr(&mut doc, -1, package_attr, package)];
    if let Some(split) = split {
        manifest_attrs.push(string_attr(&mut doc, -1, split_attr, split));
    }
    let permission = vec![string_attr(
        &mut doc,
        android,
        name_attr,
        &format!("{package}.DYNAMIC_RECEIVER_NOT_EXPORTED_PERMISSION"),
    )];
    let application_attrs = match label {
        Some(label) => vec![string_attr(&mut doc, android, label_attr, label)],
        None => vec![],
    };
    let provider = vec![
        string_attr(
            &mut doc,
            android,
            name_attr,
            "androidx.startup.InitializationProvider",
        ),
        string_attr(
            &mut doc,
            android,
            authorities_attr,
            &format!("{package}.androidx-startup"),
        ),
    ];
    let activity = vec![string_attr(
        &mut doc,
        android,
        name_attr,
        &format!("{package}.MainActivity"),
    )];

    let nodes = vec![
        Chunk::XmlStartNamespace(ResXmlNodeHeader::default(), namespace),
        start(&mut doc, "manifest", manifest_attrs),
        start(&mut doc, "uses-permission", permission),
        end(&mut doc, "uses-permission"),
        start(&mut doc, "application", application_attrs),
        start(&mut doc, "provider", provider),
        end(&mut doc, "provider"),
        start(&mut doc, "activity", activity),
        end(&mut doc, "activity"),
        end(&mut doc, "application"),
        end(&mut doc, "manifest"),
        Chunk::XmlEndNamespace(ResXmlNodeHeader::default(), namespace),
    ];
    doc.nodes = nodes;
    doc.to_bytes().unwrap()
}
