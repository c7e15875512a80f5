//! Conversion between single-record and page (columnar) documents.
//!
//! A page batches N records of one descriptor (events) or one resource
//! (datum) with every scalar field turned into a length-N column. Row order
//! is preserved, so `unpack(pack(rows)) == rows` for homogeneous input.
//!
//! `rechunk_*` re-partitions a sequence of pages into pages of a fixed size
//! without reordering rows. Rows belonging to different descriptors (or
//! resources) are never merged into one page.

use crate::document::{Datum, DatumPage, DocumentKind, Event, EventPage, Filled, Kwargs};
use crate::error::{EventModelError, ModelResult};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Pack one or more events from a single descriptor into an [`EventPage`].
///
/// Every `filled` key seen in any event gets a column; rows that do not
/// mention the key default to `false`.
pub fn pack_event_page(events: &[Event]) -> ModelResult<EventPage> {
    let first = events
        .first()
        .ok_or(EventModelError::EmptyPage(DocumentKind::Event))?;
    let columns: BTreeSet<&String> = first.data.keys().collect();
    let filled_columns: BTreeSet<&String> =
        events.iter().flat_map(|event| event.filled.keys()).collect();

    let n = events.len();
    let mut page = EventPage {
        uid: Vec::with_capacity(n),
        time: Vec::with_capacity(n),
        descriptor: first.descriptor.clone(),
        seq_num: Vec::with_capacity(n),
        data: columns
            .iter()
            .map(|key| ((*key).clone(), Vec::with_capacity(n)))
            .collect(),
        timestamps: BTreeMap::new(),
        filled: filled_columns
            .iter()
            .map(|key| ((*key).clone(), Vec::with_capacity(n)))
            .collect(),
    };

    for event in events {
        if event.descriptor != page.descriptor {
            return Err(EventModelError::MismatchedDataKeys(format!(
                "cannot pack events from descriptors {} and {} into one page",
                page.descriptor, event.descriptor
            )));
        }
        if event.data.keys().collect::<BTreeSet<_>>() != columns {
            return Err(EventModelError::MismatchedDataKeys(format!(
                "event {} has data keys {:?}, expected {:?}",
                event.uid,
                event.data.keys().collect::<Vec<_>>(),
                columns
            )));
        }
        page.uid.push(event.uid.clone());
        page.time.push(event.time);
        page.seq_num.push(event.seq_num);
        for (key, value) in &event.data {
            if let Some(column) = page.data.get_mut(key) {
                column.push(value.clone());
            }
        }
        for (key, ts) in &event.timestamps {
            page.timestamps.entry(key.clone()).or_default().push(*ts);
        }
        for (key, column) in page.filled.iter_mut() {
            column.push(event.filled.get(key).cloned().unwrap_or_default());
        }
    }

    for (key, column) in &page.timestamps {
        if column.len() != n {
            return Err(EventModelError::RaggedPage {
                column: format!("timestamps.{key}"),
                expected: n,
                found: column.len(),
            });
        }
    }
    Ok(page)
}

/// Lazily unpack an [`EventPage`] into its events.
///
/// Columns shorter than the page (or missing entirely) simply leave the
/// field out of the affected rows; fields without a `filled` entry are
/// treated as local data.
pub fn unpack_event_page(page: &EventPage) -> impl Iterator<Item = Event> + '_ {
    (0..page.len()).map(move |row| Event {
        uid: page.uid[row].clone(),
        time: page.time.get(row).copied().unwrap_or_default(),
        descriptor: page.descriptor.clone(),
        seq_num: page.seq_num.get(row).copied().unwrap_or_default(),
        data: pick_row(&page.data, row),
        timestamps: pick_row(&page.timestamps, row),
        filled: pick_row(&page.filled, row),
    })
}

/// Pack one or more datum from a single resource into a [`DatumPage`].
pub fn pack_datum_page(datum: &[Datum]) -> ModelResult<DatumPage> {
    let first = datum
        .first()
        .ok_or(EventModelError::EmptyPage(DocumentKind::Datum))?;
    let mut page = DatumPage {
        datum_id: Vec::with_capacity(datum.len()),
        resource: first.resource.clone(),
        datum_kwargs: BTreeMap::new(),
    };
    for (row, d) in datum.iter().enumerate() {
        if d.resource != page.resource {
            return Err(EventModelError::MismatchedDataKeys(format!(
                "cannot pack datum from resources {} and {} into one page",
                page.resource, d.resource
            )));
        }
        page.datum_id.push(d.datum_id.clone());
        for (key, value) in &d.datum_kwargs {
            let column = page.datum_kwargs.entry(key.clone()).or_default();
            if column.len() != row {
                return Err(EventModelError::RaggedPage {
                    column: format!("datum_kwargs.{key}"),
                    expected: row,
                    found: column.len(),
                });
            }
            column.push(value.clone());
        }
    }
    for (key, column) in &page.datum_kwargs {
        if column.len() != datum.len() {
            return Err(EventModelError::RaggedPage {
                column: format!("datum_kwargs.{key}"),
                expected: datum.len(),
                found: column.len(),
            });
        }
    }
    Ok(page)
}

/// Lazily unpack a [`DatumPage`] into its datum.
pub fn unpack_datum_page(page: &DatumPage) -> impl Iterator<Item = Datum> + '_ {
    (0..page.len()).map(move |row| Datum {
        datum_id: page.datum_id[row].clone(),
        resource: page.resource.clone(),
        datum_kwargs: pick_row(&page.datum_kwargs, row)
            .into_iter()
            .collect::<Kwargs>(),
    })
}

/// Concatenate pages of one descriptor into a single page.
pub fn merge_event_pages(pages: &[EventPage]) -> ModelResult<EventPage> {
    match pages {
        [] => Err(EventModelError::EmptyPage(DocumentKind::EventPage)),
        [only] => Ok(only.clone()),
        _ => {
            let events: Vec<Event> = pages.iter().flat_map(unpack_event_page).collect();
            pack_event_page(&events)
        }
    }
}

/// Concatenate pages of one resource into a single page.
pub fn merge_datum_pages(pages: &[DatumPage]) -> ModelResult<DatumPage> {
    match pages {
        [] => Err(EventModelError::EmptyPage(DocumentKind::DatumPage)),
        [only] => Ok(only.clone()),
        _ => {
            let datum: Vec<Datum> = pages.iter().flat_map(unpack_datum_page).collect();
            pack_datum_page(&datum)
        }
    }
}

/// Re-partition event pages into pages of `chunk_size` rows.
pub fn rechunk_event_pages<I>(pages: I, chunk_size: usize) -> ModelResult<Rechunk<I::IntoIter>>
where
    I: IntoIterator<Item = EventPage>,
{
    Rechunk::new(pages.into_iter(), chunk_size)
}

/// Re-partition datum pages into pages of `chunk_size` rows.
pub fn rechunk_datum_pages<I>(pages: I, chunk_size: usize) -> ModelResult<Rechunk<I::IntoIter>>
where
    I: IntoIterator<Item = DatumPage>,
{
    Rechunk::new(pages.into_iter(), chunk_size)
}

/// A page type that can be split into rows and rebuilt from them.
pub trait Paged: Sized {
    /// Single-record form.
    type Row;

    /// Rows of the page, in order.
    fn rows(&self) -> Vec<Self::Row>;

    /// Build a page from rows of one group.
    fn pack(rows: &[Self::Row]) -> ModelResult<Self>;

    /// The descriptor or resource the rows belong to.
    fn group_of(row: &Self::Row) -> &str;
}

impl Paged for EventPage {
    type Row = Event;

    fn rows(&self) -> Vec<Event> {
        unpack_event_page(self).collect()
    }

    fn pack(rows: &[Event]) -> ModelResult<Self> {
        pack_event_page(rows)
    }

    fn group_of(row: &Event) -> &str {
        &row.descriptor
    }
}

impl Paged for DatumPage {
    type Row = Datum;

    fn rows(&self) -> Vec<Datum> {
        unpack_datum_page(self).collect()
    }

    fn pack(rows: &[Datum]) -> ModelResult<Self> {
        pack_datum_page(rows)
    }

    fn group_of(row: &Datum) -> &str {
        &row.resource
    }
}

/// Iterator returned by [`rechunk_event_pages`] and [`rechunk_datum_pages`].
pub struct Rechunk<I>
where
    I: Iterator,
    I::Item: Paged,
{
    pages: I,
    chunk_size: usize,
    pending: VecDeque<<I::Item as Paged>::Row>,
    exhausted: bool,
}

impl<I> Rechunk<I>
where
    I: Iterator,
    I::Item: Paged,
{
    fn new(pages: I, chunk_size: usize) -> ModelResult<Self> {
        if chunk_size == 0 {
            return Err(EventModelError::InvalidDocument(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            pages,
            chunk_size,
            pending: VecDeque::new(),
            exhausted: false,
        })
    }

    /// Length of the leading run of rows that share a group, capped at chunk_size.
    fn ready_rows(&self) -> usize {
        let Some(first) = self.pending.front() else {
            return 0;
        };
        let group = <I::Item as Paged>::group_of(first);
        self.pending
            .iter()
            .take(self.chunk_size)
            .take_while(|row| <I::Item as Paged>::group_of(row) == group)
            .count()
    }
}

impl<I> Iterator for Rechunk<I>
where
    I: Iterator,
    I::Item: Paged,
{
    type Item = ModelResult<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let ready = self.ready_rows();
            let group_break = ready > 0 && ready < self.pending.len().min(self.chunk_size);
            if ready == self.chunk_size || group_break || (self.exhausted && ready > 0) {
                let rows: Vec<_> = self.pending.drain(..ready).collect();
                return Some(<I::Item as Paged>::pack(&rows));
            }
            if self.exhausted {
                return None;
            }
            match self.pages.next() {
                Some(page) => self.pending.extend(page.rows()),
                None => self.exhausted = true,
            }
        }
    }
}

fn pick_row<T: Clone>(columns: &BTreeMap<String, Vec<T>>, row: usize) -> BTreeMap<String, T> {
    columns
        .iter()
        .filter_map(|(key, column)| column.get(row).map(|v| (key.clone(), v.clone())))
        .collect()
}

/// True if the filled column for `key` has any pending entry.
pub(crate) fn column_pending(column: &[Filled]) -> bool {
    column.iter().any(Filled::is_pending)
}
