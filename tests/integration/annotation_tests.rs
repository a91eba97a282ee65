//! Annotation integration tests.
//!
//! Tests verify:
//! - Masks rasterize level-0 polygons with later items winning
//! - Failed edits leave the document unchanged
//! - Labels files round through a template's output keys
//! - Geographic vertices come from the store's geo-transform
//! - Overlays close their outlines

use pyramid_label::annotation::{
    labels_to_json, load_labels, parse_overlay, save_labels, LabelsContext, LineStyle,
};
use pyramid_label::{
    create_dataset, AnnotationError, ClassCodes, DataLocator, FieldValue, GeoTransform,
    GeometryError, LabelDocument, LabelsFormat, NewDataset, Point, PyramidBuilder, PyramidLayout,
    RasterStore, SampleType, Template,
};
use serde_json::json;

use super::test_utils::{gradient_store, open, small_pyramid, square};

const TEMPLATE: &str = r#"{
    "template_info": [
        {"type": "combobox", "label": "Class", "options": ["Building", "Road"]},
        {"type": "lineedit", "label": "Notes"}
    ],
    "image_info": {"data_path": "data", "geo_transform": "transform"},
    "outputs_options": {
        "include_mask": true,
        "include_bounding_rect": true,
        "mask_label": "Class",
        "default_output_keys": {"label_item_vertices": "outline", "label_item_uuid": "id"}
    }
}"#;

fn labelled(doc: &mut LabelDocument, vertices: Vec<Point>, class: &str) {
    let id = doc.add_polygon(vertices).unwrap();
    doc.set_field(id, "Class", FieldValue::Text(class.to_string()))
        .unwrap();
}

#[test]
fn test_building_square_mask() {
    let template = Template::from_json(TEMPLATE).unwrap();
    let codes = template.mask_codes().unwrap().unwrap();

    let mut doc = LabelDocument::new();
    labelled(&mut doc, square(10.0, 10.0, 20.0, 20.0), "Building");

    let mask = doc.rasterize_mask("Class", &codes, (30, 30), 1.0);
    assert_eq!(mask.count(1), 100);
    assert_eq!(mask.count(0), 900 - 100);
    for y in 0..30 {
        for x in 0..30 {
            let inside = (10..20).contains(&x) && (10..20).contains(&y);
            assert_eq!(mask.get(x, y), Some(if inside { 1 } else { 0 }));
        }
    }
}

#[test]
fn test_later_polygon_wins() {
    let mut doc = LabelDocument::new();
    labelled(&mut doc, square(0.0, 0.0, 20.0, 20.0), "Road");
    labelled(&mut doc, square(5.0, 5.0, 10.0, 10.0), "Building");

    let codes = ClassCodes::from_options(&["Building", "Road"]);
    let mask = doc.rasterize_mask("Class", &codes, (20, 20), 1.0);
    assert_eq!(mask.get(6, 6), Some(1));
    assert_eq!(mask.count(1), 25);
    assert_eq!(mask.count(2), 400 - 25);
}

#[test]
fn test_mask_at_coarser_level() {
    let layout = PyramidLayout::new(40, 40, 2, 8, true);
    let (w, h) = layout.dimensions(1).unwrap();

    let mut doc = LabelDocument::new();
    labelled(&mut doc, square(10.0, 10.0, 20.0, 20.0), "Building");

    let codes = ClassCodes::from_options(&["Building"]);
    let mask = doc.rasterize_mask("Class", &codes, (h as usize, w as usize), 2.0);
    assert_eq!((mask.width(), mask.height()), (20, 20));
    assert_eq!(mask.count(1), 25);
    assert_eq!(mask.get(5, 5), Some(1));
    assert_eq!(mask.get(10, 10), Some(0));
}

#[test]
fn test_triangle_vertex_delete_rejected() {
    let mut doc = LabelDocument::new();
    let id = doc
        .add_polygon(vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(0.0, 10.0),
        ])
        .unwrap();
    let before = doc.item(id).unwrap().clone();

    assert!(matches!(
        doc.delete_vertex(id, 1),
        Err(AnnotationError::Geometry(GeometryError::MinimumVertices { .. }))
    ));
    assert_eq!(doc.item(id).unwrap(), &before);

    // moving onto a neighbour is rejected the same way
    assert!(doc.move_vertex(id, 1, Point::new(0.0, 0.0)).is_err());
    assert_eq!(doc.item(id).unwrap(), &before);
}

#[test]
fn test_edits_reflect_in_derived_data() {
    let mut doc = LabelDocument::new();
    let id = doc.add_polygon(square(0.0, 0.0, 4.0, 4.0)).unwrap();

    let index = doc.add_vertex(id, Point::new(2.0, -3.0)).unwrap();
    assert_eq!(index, 1);
    assert_eq!(doc.item(id).unwrap().vertices().len(), 5);

    let rect = doc.bounding_rect(id).unwrap();
    assert_eq!((rect.width(), rect.height()), (4.0, 7.0));

    doc.delete_vertex(id, 1).unwrap();
    assert_eq!(doc.covered_pixels(id).unwrap().len(), 16);
}

#[tokio::test]
async fn test_labels_file_with_template_keys() {
    let template = Template::from_json(TEMPLATE).unwrap();
    let format = LabelsFormat::from_template(&template);

    let mut doc = LabelDocument::new();
    let first = doc
        .add_polygon_with_fields(square(1.0, 1.0, 3.0, 3.0), template.default_values())
        .unwrap();
    labelled(&mut doc, square(5.0, 5.0, 8.0, 9.0), "Road");

    let value = labels_to_json(&doc, &format, &LabelsContext::default()).unwrap();
    let records = value.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], json!(first.to_string()));
    assert_eq!(records[0]["Class"], json!("Building"));
    assert_eq!(
        records[0]["outline"],
        json!([[1.0, 1.0], [3.0, 1.0], [3.0, 3.0], [1.0, 3.0], [1.0, 1.0]])
    );
    assert_eq!(records[0]["label_item_pixels"].as_array().unwrap().len(), 4);
    assert_eq!(
        records[1]["label_item_bounding_rect"],
        json!([[5, 5], [8, 5], [8, 9], [5, 9]])
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(format!("scene{}", template.outputs.labels_extension));
    save_labels(&path, &doc, &format, &LabelsContext::default())
        .await
        .unwrap();

    let loaded = load_labels(&path, &format).await.unwrap();
    assert_eq!(loaded.len(), 2);
    let item = loaded.item(first).unwrap();
    assert_eq!(item.vertices(), doc.item(first).unwrap().vertices());
    assert_eq!(item.field("Class"), Some(&FieldValue::Text("Building".into())));
    assert!(item.field("label_item_pixels").is_none());
}

#[tokio::test]
async fn test_geo_vertices_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let geo = GeoTransform::new([[2.0, 0.0, 100.0], [0.0, -2.0, 50.0], [0.0, 0.0, 1.0]]).unwrap();
    let desc = NewDataset::new("data", 4, 4, 1, SampleType::U8).with_geo_transform(geo);
    create_dataset(dir.path(), &desc, &[0u8; 16]).await.unwrap();

    let template = Template::from_json(TEMPLATE).unwrap();
    let store = RasterStore::open(dir.path(), &template.locator).await.unwrap();
    let transform = store.info().geo_transform;
    assert_eq!(transform, Some(geo));

    let mut doc = LabelDocument::new();
    let id = doc.add_polygon(square(0.0, 0.0, 2.0, 2.0)).unwrap();

    let coords = doc.geo_vertices(id, transform.as_ref()).unwrap().unwrap();
    // pixel centres
    assert_eq!(coords[0], [101.0, 49.0]);
    assert_eq!(coords[2], [105.0, 45.0]);

    let context = LabelsContext {
        image_filename: Some("scene.tif".to_string()),
        geo_transform: transform,
    };
    let format = LabelsFormat::from_template(&template);
    let value = labels_to_json(&doc, &format, &context).unwrap();
    assert_eq!(value[0]["geo_vertices"].as_array().unwrap().len(), 5);
    assert_eq!(value[0]["image_filename"], json!("scene.tif"));

    assert!(doc.geo_vertices(id, None).unwrap().is_none());
}

#[tokio::test]
async fn test_labels_independent_of_displayed_level() {
    let dir = gradient_store(64, 64).await;
    let store = open(dir.path()).await;
    let builder = PyramidBuilder::new(small_pyramid());
    let level = builder.ensure_level(&store, 2).await.unwrap();

    let mut doc = LabelDocument::new();
    labelled(&mut doc, square(8.0, 8.0, 24.0, 24.0), "Building");

    // the same document rasterized at level 0 and level 2
    let codes = ClassCodes::from_options(&["Building"]);
    let full = doc.rasterize_mask("Class", &codes, (64, 64), 1.0);
    let coarse = doc.rasterize_mask(
        "Class",
        &codes,
        (level.height as usize, level.width as usize),
        level.downsample,
    );
    assert_eq!(full.count(1), 256);
    assert_eq!(coarse.count(1), 16);

    let item = doc.items().next().unwrap();
    assert_eq!(item.vertices()[0], Point::new(8.0, 8.0));
}

#[test]
fn test_overlay_is_closed() {
    let overlay = parse_overlay(&json!([
        {"vertices": [[0, 0], [5, 5], [0, 0]], "style": "dashed"},
        {"vertices": [[0, 0], [5, 0], [5, 5]], "style": "wavy", "color": [1, 2, 3, 4]}
    ]))
    .unwrap();

    assert!(overlay[0].is_closed());
    assert_eq!(overlay[0].style, LineStyle::Dashed);
    assert!(!overlay[1].is_closed());
    assert_eq!(overlay[1].style, LineStyle::Solid);
    assert_eq!(overlay[1].color, [1, 2, 3, 4]);
}

#[tokio::test]
async fn test_store_locator_from_template() {
    let dir = gradient_store(8, 8).await;
    let template = Template::from_json(TEMPLATE).unwrap();
    assert_eq!(template.locator, DataLocator::new("data").with_geo_transform("transform"));

    let store = RasterStore::open(dir.path(), &template.locator).await.unwrap();
    assert!(store.info().geo_transform.is_none());
}
