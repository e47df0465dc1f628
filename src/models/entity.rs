use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AlmError, Result};

// ==================================================================================================
// Entity
// ==================================================================================================

/// A remote ALM record: field name to value. Unset fields are absent keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub fields: BTreeMap<String, String>,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn id(&self) -> Option<&str> {
        self.field("id")
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.set_field("id", id);
    }

    pub fn status(&self) -> Option<&str> {
        self.field("status")
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.set_field("status", status);
    }

    pub fn name(&self) -> Option<&str> {
        self.field("name")
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.set_field("name", name);
    }

    pub fn description(&self) -> Option<&str> {
        self.field("description")
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.set_field("description", description);
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialize as an update payload:
    /// `<Entity Type="..."><Fields><Field Name="..."><Value>...</Value></Field>...</Fields></Entity>`
    pub fn to_xml(&self, entity_type: &str) -> Result<String> {
        let mut writer = Writer::new(Vec::new());

        write(
            &mut writer,
            Event::Start(BytesStart::new("Entity").with_attributes([("Type", entity_type)])),
        )?;
        write(&mut writer, Event::Start(BytesStart::new("Fields")))?;

        for (name, value) in &self.fields {
            write(
                &mut writer,
                Event::Start(BytesStart::new("Field").with_attributes([("Name", name.as_str())])),
            )?;
            write(&mut writer, Event::Start(BytesStart::new("Value")))?;
            write(&mut writer, Event::Text(BytesText::new(value)))?;
            write(&mut writer, Event::End(BytesEnd::new("Value")))?;
            write(&mut writer, Event::End(BytesEnd::new("Field")))?;
        }

        write(&mut writer, Event::End(BytesEnd::new("Fields")))?;
        write(&mut writer, Event::End(BytesEnd::new("Entity")))?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| AlmError::MalformedResponse(format!("Entity XML is not UTF-8: {}", e)))
    }

    /// Parse a single `<Entity>` document
    pub fn from_xml(xml: &str) -> Result<Self> {
        let parsed = parse_entities(xml, 1)?;
        parsed
            .entities
            .into_iter()
            .next()
            .ok_or_else(|| AlmError::MalformedResponse("Document has no entity".to_string()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Entity {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| AlmError::MalformedResponse(format!("Failed to write entity XML: {}", e)))
}

// ==================================================================================================
// Collection pages
// ==================================================================================================

/// One page of a collection read
#[derive(Debug, Clone, Default)]
pub struct EntityPage {
    /// Raw `TotalResults` attribute of the root element, if present
    pub total_results: Option<String>,
    pub entities: Vec<Entity>,
}

impl EntityPage {
    /// Parse a collection document whose root's children are entities
    pub fn from_xml(xml: &str) -> Result<Self> {
        parse_entities(xml, 2)
    }
}

fn malformed(e: impl std::fmt::Display) -> AlmError {
    AlmError::MalformedResponse(e.to_string())
}

fn attribute(element: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    match element.try_get_attribute(name).map_err(malformed)? {
        Some(attr) => Ok(Some(attr.unescape_value().map_err(malformed)?.into_owned())),
        None => Ok(None),
    }
}

#[derive(Default)]
struct FieldState {
    name: Option<String>,
    value: Option<String>,
    depth: usize,
    in_value: bool,
}

/// Walk the document, treating elements at `entity_depth` as entities.
/// Within an entity only `Fields/Field` children count; a field's first
/// `Value` child is its value and a field without one is skipped.
fn parse_entities(xml: &str, entity_depth: usize) -> Result<EntityPage> {
    let mut reader = Reader::from_str(xml);
    let mut page = EntityPage::default();

    let mut depth = 0usize;
    let mut current: Option<Entity> = None;
    let mut fields_depth: Option<usize> = None;
    let mut field: Option<FieldState> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            AlmError::MalformedResponse(format!(
                "Invalid XML at position {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                depth += 1;
                let tag = e.local_name();
                let tag = tag.as_ref();

                if depth == 1 {
                    page.total_results = attribute(e, "TotalResults")?;
                }

                if depth == entity_depth {
                    current = Some(Entity::new());
                } else if current.is_some() {
                    if depth == entity_depth + 1 && tag == b"Fields" {
                        fields_depth = Some(depth);
                    } else if fields_depth.is_some_and(|d| depth == d + 1) && tag == b"Field" {
                        field = Some(FieldState {
                            name: attribute(e, "Name")?,
                            depth,
                            ..FieldState::default()
                        });
                    } else if let Some(f) = field.as_mut() {
                        if depth == f.depth + 1 && tag == b"Value" && f.value.is_none() {
                            f.value = Some(String::new());
                            f.in_value = true;
                        }
                    }
                }

                if is_empty {
                    close(depth, entity_depth, &mut current, &mut fields_depth, &mut field, &mut page);
                    depth -= 1;
                }
            }

            Event::Text(ref t) => {
                if let Some(f) = field.as_mut().filter(|f| f.in_value) {
                    let text = t.unescape().map_err(malformed)?;
                    if let Some(value) = f.value.as_mut() {
                        value.push_str(&text);
                    }
                }
            }

            Event::CData(ref c) => {
                if let Some(f) = field.as_mut().filter(|f| f.in_value) {
                    if let Some(value) = f.value.as_mut() {
                        value.push_str(&String::from_utf8_lossy(c));
                    }
                }
            }

            Event::End(_) => {
                close(depth, entity_depth, &mut current, &mut fields_depth, &mut field, &mut page);
                depth = depth.saturating_sub(1);
            }

            Event::Eof => break,

            _ => {}
        }
    }

    Ok(page)
}

/// Handle the end of the element at `depth`
fn close(
    depth: usize,
    entity_depth: usize,
    current: &mut Option<Entity>,
    fields_depth: &mut Option<usize>,
    field: &mut Option<FieldState>,
    page: &mut EntityPage,
) {
    if let Some(f) = field.as_mut() {
        if f.in_value && depth == f.depth + 1 {
            f.in_value = false;
            return;
        }

        if depth == f.depth {
            if let (Some(entity), Some(f)) = (current.as_mut(), field.take()) {
                match (f.name, f.value) {
                    (Some(name), Some(value)) => {
                        entity.fields.insert(name, value);
                    }
                    (name, None) => {
                        tracing::trace!(field = ?name, "Skipping field without a value");
                    }
                    (None, Some(_)) => {
                        tracing::debug!("Skipping field without a Name attribute");
                    }
                }
            }
            return;
        }
    }

    if *fields_depth == Some(depth) {
        *fields_depth = None;
    } else if depth == entity_depth {
        if let Some(entity) = current.take() {
            page.entities.push(entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_project_onto_fields() {
        let mut entity = Entity::new();
        assert_eq!(entity.status(), None);

        entity.set_id("7");
        entity.set_status("Open");
        entity.set_name("Crash on save");
        entity.set_description("Steps...");

        assert_eq!(entity.field("id"), Some("7"));
        assert_eq!(entity.status(), Some("Open"));
        assert_eq!(entity.name(), Some("Crash on save"));
        assert_eq!(entity.description(), Some("Steps..."));
        assert_eq!(entity.fields.len(), 4);
    }

    #[test]
    fn test_serialize_update_payload() {
        let entity: Entity = [("id", "7"), ("status", "Open")].into_iter().collect();
        let xml = entity.to_xml("defects").unwrap();

        assert!(xml.starts_with("<Entity Type=\"defects\"><Fields>"));
        assert!(xml.contains("<Field Name=\"status\"><Value>Open</Value></Field>"));
        assert!(xml.contains("<Field Name=\"id\"><Value>7</Value></Field>"));
        assert!(xml.ends_with("</Fields></Entity>"));
    }

    #[test]
    fn test_serialized_payload_parses_back() {
        let entity: Entity = [("id", "7"), ("status", "Open")].into_iter().collect();
        let xml = entity.to_xml("defects").unwrap();

        assert_eq!(Entity::from_xml(&xml).unwrap(), entity);
    }

    #[test]
    fn test_values_are_escaped() {
        let entity: Entity = [("description", "a < b & \"c\"")].into_iter().collect();
        let xml = entity.to_xml("defects").unwrap();

        assert!(!xml.contains("a < b"));
        assert_eq!(
            Entity::from_xml(&xml).unwrap().description(),
            Some("a < b & \"c\"")
        );
    }

    #[test]
    fn test_field_without_value_is_skipped() {
        let xml = r#"<Entity Type="defect">
            <Fields>
                <Field Name="id"><Value>7</Value></Field>
                <Field Name="owner"/>
                <Field Name="severity"></Field>
                <Field Name="status"><Value>Open</Value></Field>
                <Field Name="dev-comments"><Value/></Field>
            </Fields>
        </Entity>"#;

        let entity = Entity::from_xml(xml).unwrap();
        assert_eq!(entity.id(), Some("7"));
        assert_eq!(entity.status(), Some("Open"));
        assert_eq!(entity.field("owner"), None);
        assert_eq!(entity.field("severity"), None);
        assert_eq!(entity.field("dev-comments"), Some(""));
        assert_eq!(entity.fields.len(), 3);
    }

    #[test]
    fn test_parse_collection_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Entities TotalResults="250">
  <Entity Type="defect">
    <ChildrenCount><Value>0</Value></ChildrenCount>
    <Fields>
      <Field Name="id"><Value>1</Value></Field>
      <Field Name="name"><Value><![CDATA[Login <fails>]]></Value></Field>
    </Fields>
    <RelatedEntities/>
  </Entity>
  <Entity Type="defect">
    <Fields>
      <Field Name="id"><Value>2</Value><Value>ignored</Value></Field>
      <Field Name="status"><Value>Closed &amp; verified</Value></Field>
    </Fields>
  </Entity>
</Entities>"#;

        let page = EntityPage::from_xml(xml).unwrap();
        assert_eq!(page.total_results.as_deref(), Some("250"));
        assert_eq!(page.entities.len(), 2);
        assert_eq!(page.entities[0].id(), Some("1"));
        assert_eq!(page.entities[0].name(), Some("Login <fails>"));
        assert_eq!(page.entities[0].fields.len(), 2);
        assert_eq!(page.entities[1].id(), Some("2"));
        assert_eq!(page.entities[1].status(), Some("Closed & verified"));
    }

    #[test]
    fn test_parse_page_without_total() {
        let page = EntityPage::from_xml("<Entities><Entity><Fields/></Entity></Entities>").unwrap();
        assert_eq!(page.total_results, None);
        assert_eq!(page.entities, vec![Entity::new()]);
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        let result = EntityPage::from_xml("<Entities><Entity></Entities>");
        assert!(matches!(result, Err(AlmError::MalformedResponse(_))));
    }
}
