//! Page conversion and wire envelope behaviour seen from outside the crate.

use event_model::document::{Datum, Document, Event, EventPage, Filled, Kwargs};
use event_model::router::{dispatch, DocumentRouter, Passthrough, Routed};
use event_model::{
    merge_event_pages, pack_datum_page, pack_event_page, rechunk_datum_pages,
    rechunk_event_pages, unpack_datum_page, unpack_event_page, ModelResult,
};
use serde_json::json;
use std::collections::BTreeMap;

fn events(descriptor: &str, seq: std::ops::RangeInclusive<u64>) -> Vec<Event> {
    seq.map(|n| Event {
        uid: format!("{descriptor}-{n}"),
        time: n as f64,
        descriptor: descriptor.to_string(),
        seq_num: n,
        data: BTreeMap::from([
            ("x".to_string(), json!(n)),
            ("img".to_string(), json!(format!("r/{n}"))),
        ]),
        timestamps: BTreeMap::from([("x".to_string(), n as f64), ("img".to_string(), n as f64)]),
        filled: BTreeMap::from([("img".to_string(), Filled::Flag(false))]),
    })
    .collect()
}

#[test]
fn test_rechunk_keeps_rows_and_groups() {
    let mut rows = events("a", 1..=5);
    rows.extend(events("b", 1..=2));
    let pages = vec![
        pack_event_page(&rows[..2]).unwrap(),
        pack_event_page(&rows[2..5]).unwrap(),
        pack_event_page(&rows[5..]).unwrap(),
    ];

    let chunks: Vec<EventPage> = rechunk_event_pages(pages, 3)
        .unwrap()
        .collect::<ModelResult<_>>()
        .unwrap();
    let sizes: Vec<usize> = chunks.iter().map(EventPage::len).collect();
    assert_eq!(sizes, vec![3, 2, 2]);
    assert!(chunks[..2].iter().all(|page| page.descriptor == "a"));
    assert_eq!(chunks[2].descriptor, "b");

    let flattened: Vec<Event> = chunks.iter().flat_map(unpack_event_page).collect();
    assert_eq!(flattened, rows);
}

#[test]
fn test_rechunk_rejects_zero_chunk() {
    assert!(rechunk_event_pages(Vec::<EventPage>::new(), 0).is_err());
}

#[test]
fn test_merge_concatenates_in_order() {
    let rows = events("a", 1..=4);
    let merged = merge_event_pages(&[
        pack_event_page(&rows[..1]).unwrap(),
        pack_event_page(&rows[1..]).unwrap(),
    ])
    .unwrap();
    assert_eq!(merged.seq_num, vec![1, 2, 3, 4]);
    assert_eq!(merged.filled["img"].len(), 4);
}

#[test]
fn test_datum_pages_rechunk() {
    let datum: Vec<Datum> = (0..5)
        .map(|n| {
            let mut kwargs = Kwargs::new();
            kwargs.insert("frame".to_string(), json!(n));
            Datum {
                datum_id: format!("r/{n}"),
                resource: "r".to_string(),
                datum_kwargs: kwargs,
            }
        })
        .collect();
    let page = pack_datum_page(&datum).unwrap();
    let chunks: Vec<_> = rechunk_datum_pages([page], 2)
        .unwrap()
        .collect::<ModelResult<Vec<_>>>()
        .unwrap();
    assert_eq!(chunks.len(), 3);
    let back: Vec<Datum> = chunks.iter().flat_map(unpack_datum_page).collect();
    assert_eq!(back, datum);
}

#[test]
fn test_wire_envelope() {
    let event = events("a", 1..=1).remove(0);
    let wire = serde_json::to_value(Document::Event(event.clone())).unwrap();
    assert_eq!(wire["name"], "event");
    assert_eq!(wire["doc"]["seq_num"], 1);
    assert_eq!(wire["doc"]["filled"]["img"], false);

    let back: Document = serde_json::from_value(wire).unwrap();
    assert_eq!(back, Document::Event(event));

    let page = serde_json::to_value(Document::EventPage(
        pack_event_page(&events("a", 1..=2)).unwrap(),
    ))
    .unwrap();
    assert_eq!(page["name"], "event_page");
    assert_eq!(page["doc"]["data"]["x"], json!([1, 2]));
}

#[test]
fn test_unknown_kind_is_rejected() {
    let wire = json!({"name": "bulk_events", "doc": {}});
    assert!(serde_json::from_value::<Document>(wire).is_err());
}

/// Doubles `x` and only understands single events.
struct Doubler;

impl DocumentRouter for Doubler {
    fn event(&mut self, mut event: Event) -> ModelResult<Routed<Event>> {
        if let Some(x) = event.data.get("x").and_then(|v| v.as_u64()) {
            event.data.insert("x".to_string(), json!(x * 2));
        }
        Ok(Routed::Handled(event))
    }
}

#[test]
fn test_pages_reach_single_event_router() {
    let page = pack_event_page(&events("a", 1..=3)).unwrap();
    let out = dispatch(&mut Doubler, Document::EventPage(page)).unwrap();
    let Document::EventPage(out) = out else {
        panic!("page in, page out");
    };
    assert_eq!(out.data["x"], vec![json!(2), json!(4), json!(6)]);

    let untouched = pack_event_page(&events("a", 1..=2)).unwrap();
    let same = dispatch(&mut Passthrough, Document::EventPage(untouched.clone())).unwrap();
    assert_eq!(same, Document::EventPage(untouched));
}
