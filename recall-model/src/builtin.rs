//! Schemas of the entity kinds the application ships with.
//!
//! Field lists only cover what the engine validates; rows may carry more.
//! All builtin tables version rows with an `updated_at` millisecond column.

use crate::{EntitySchema, FieldSpec};

/// Version column shared by all builtin tables.
pub const VERSION_FIELD: &str = "updated_at";

fn kind(kind: &str, table: &str) -> EntitySchema {
    EntitySchema::new(kind, table)
        .with_version_field(VERSION_FIELD)
        .with_field(FieldSpec::datetime("created_at"))
        .with_field(FieldSpec::datetime(VERSION_FIELD))
}

pub fn works() -> EntitySchema {
    kind("work", "works")
        .with_field(FieldSpec::text("title").required())
        .with_field(FieldSpec::text("subtitle"))
        .with_field(FieldSpec::json("authors"))
        .with_field(FieldSpec::number("year"))
        .with_field(FieldSpec::tags("topics"))
        .with_field(FieldSpec::bool("favorite"))
        .with_field(FieldSpec::relation("preset_id"))
        .with_field(FieldSpec::json("metadata"))
}

pub fn assets() -> EntitySchema {
    kind("asset", "assets")
        .with_field(FieldSpec::text("sha256").required())
        .with_field(FieldSpec::text("filename"))
        .with_field(FieldSpec::text("mime"))
        .with_field(FieldSpec::number("bytes"))
        .with_field(FieldSpec::relation("work_id"))
        .with_field(FieldSpec::enumeration("role", &["main", "supplement", "slides", "notes", "exercises"]))
        .with_field(FieldSpec::json("metadata"))
}

pub fn authors() -> EntitySchema {
    kind("author", "authors")
        .with_field(FieldSpec::text("last_name").required())
        .with_field(FieldSpec::text("first_name"))
        .with_field(FieldSpec::text("orcid"))
        .with_field(FieldSpec::json("avatar_crop_region"))
}

pub fn collections() -> EntitySchema {
    kind("collection", "collections")
        .with_field(FieldSpec::text("name").required())
        .with_field(FieldSpec::text("description"))
        .with_field(FieldSpec::tags("work_ids"))
        .with_field(FieldSpec::bool("is_private"))
}

pub fn edges() -> EntitySchema {
    kind("edge", "edges")
        .with_field(FieldSpec::relation("from_id").required())
        .with_field(FieldSpec::relation("to_id").required())
        .with_field(FieldSpec::enumeration(
            "relation",
            &["contains", "cites", "related_to", "attached_to"],
        ))
        .with_field(FieldSpec::number("order"))
}

pub fn presets() -> EntitySchema {
    kind("preset", "presets")
        .with_field(FieldSpec::text("name").required())
        .with_field(FieldSpec::enumeration("target_entity", &["work", "asset", "activity"]))
        .with_field(FieldSpec::json("core_field_config"))
        .with_field(FieldSpec::json("custom_fields"))
        .with_field(FieldSpec::bool("is_system"))
}

pub fn annotations() -> EntitySchema {
    kind("annotation", "annotations")
        .with_field(FieldSpec::text("sha256").required())
        .with_field(FieldSpec::number("page").required())
        .with_field(FieldSpec::enumeration("type", &["rectangle", "highlight"]))
        .with_field(FieldSpec::json("geometry"))
        .with_field(FieldSpec::json("style"))
        .with_field(FieldSpec::text("content"))
        .with_field(FieldSpec::json("metadata"))
}

pub fn cards() -> EntitySchema {
    kind("card", "cards")
        .with_field(FieldSpec::relation("annotation_id"))
        .with_field(FieldSpec::text("front").required())
        .with_field(FieldSpec::text("back"))
        .with_field(FieldSpec::datetime("due"))
        .with_field(FieldSpec::enumeration("state", &["new", "learning", "review", "relearning"]))
}

pub fn review_logs() -> EntitySchema {
    kind("review_log", "review_logs")
        .with_field(FieldSpec::relation("card_id").required())
        .with_field(FieldSpec::enumeration("rating", &["again", "hard", "good", "easy"]))
        .with_field(FieldSpec::datetime("review"))
}

pub fn boards() -> EntitySchema {
    kind("board", "boards")
        .with_field(FieldSpec::text("name").required())
        .with_field(FieldSpec::text("background_color"))
        .with_field(FieldSpec::number("width"))
        .with_field(FieldSpec::number("height"))
}

pub fn strokes() -> EntitySchema {
    kind("stroke", "strokes")
        .with_field(FieldSpec::relation("board_id").required())
        .with_field(FieldSpec::json("points").required())
        .with_field(FieldSpec::json("style"))
        .with_field(FieldSpec::json("bounding_box"))
}

pub fn activities() -> EntitySchema {
    kind("activity", "activities")
        .with_field(FieldSpec::text("title").required())
        .with_field(FieldSpec::enumeration(
            "activity_type",
            &["course", "workshop", "seminar", "project", "other"],
        ))
        .with_field(FieldSpec::datetime("starts_at"))
        .with_field(FieldSpec::datetime("ends_at"))
}

pub fn notes() -> EntitySchema {
    kind("note", "notes")
        .with_field(FieldSpec::text("body"))
        .with_field(FieldSpec::relation("annotation_id"))
        .with_field(FieldSpec::relation("asset_id"))
}

/// Every builtin kind.
pub fn all() -> Vec<EntitySchema> {
    vec![
        works(),
        assets(),
        authors(),
        collections(),
        edges(),
        presets(),
        annotations(),
        cards(),
        review_logs(),
        boards(),
        strokes(),
        activities(),
        notes(),
    ]
}
