#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;

use proptest::collection::btree_set;
use proptest::prelude::*;
use sombra_hibernate::hibernate::{write_snapshot, DatabaseNames, Record, RecordReader, SaveDir};
use sombra_hibernate::types::{DatabaseId, PageNo, PageTag, Slot};
use tempfile::tempdir;

struct Names;

impl DatabaseNames for Names {
    fn database_name(&self, database: DatabaseId) -> Option<String> {
        Some(format!("db{}", database.0))
    }
}

/// Expands a save-file back into the tags it lists.
fn decode(path: &std::path::Path, database: DatabaseId) -> Vec<PageTag> {
    let mut tags = Vec::new();
    let mut object = None;
    let mut fork = None;
    let mut last = None;
    for record in RecordReader::new(File::open(path).unwrap()) {
        match record.unwrap() {
            Record::DatabaseName(_) => {}
            Record::Object(id) => object = Some(id),
            Record::Fork(f) => fork = Some(f),
            Record::Page(page) => {
                last = Some(page);
                tags.push(PageTag {
                    database,
                    object: object.unwrap(),
                    fork: fork.unwrap(),
                    page,
                });
            }
            Record::Range(count) => {
                let first = last.take().unwrap();
                for step in 1..=count {
                    tags.push(PageTag {
                        database,
                        object: object.unwrap(),
                        fork: fork.unwrap(),
                        page: PageNo(first.0 + step),
                    });
                }
            }
        }
    }
    tags
}

fn tag_strategy() -> impl Strategy<Value = PageTag> {
    (0u32..4, 1u32..6, 0u32..3, 0u32..48)
        .prop_map(|(db, obj, fork, page)| PageTag::new(db, obj, fork, page))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn saved_files_list_exactly_the_resident_pages(tags in btree_set(tag_strategy(), 0..300)) {
        let tmp = tempdir().unwrap();
        let dir = SaveDir::new(tmp.path());
        let mut shuffled: Vec<PageTag> = tags.iter().copied().collect();
        shuffled.reverse();
        let report = write_snapshot(shuffled, &Names, &dir).unwrap();

        let databases: BTreeSet<DatabaseId> = tags.iter().map(|t| t.database).collect();
        prop_assert_eq!(report.files.len(), databases.len());
        prop_assert_eq!(report.pages_saved, tags.len() as u64);

        let mut expected_slot = 2;
        let mut decoded = BTreeSet::new();
        let slots: BTreeMap<u32, DatabaseId> = databases
            .iter()
            .map(|db| {
                if db.is_global() {
                    (Slot::GLOBAL.0, *db)
                } else {
                    let slot = expected_slot;
                    expected_slot += 1;
                    (slot, *db)
                }
            })
            .collect();
        for (slot, database) in &slots {
            let path = dir.file_path(Slot(*slot));
            let pages = decode(&path, *database);
            let mut sorted = pages.clone();
            sorted.sort();
            prop_assert_eq!(&pages, &sorted, "file content must be in tag order");
            decoded.extend(pages);
        }
        prop_assert_eq!(decoded, tags);
    }

    #[test]
    fn no_two_page_records_form_a_run(pages in btree_set(0u32..200, 1..120)) {
        let tmp = tempdir().unwrap();
        let dir = SaveDir::new(tmp.path());
        let tags = pages.iter().map(|p| PageTag::new(3, 1, 0, *p)).collect();
        write_snapshot(tags, &Names, &dir).unwrap();

        let mut previous: Option<u32> = None;
        for record in RecordReader::new(File::open(dir.file_path(Slot(2))).unwrap()) {
            match record.unwrap() {
                Record::Page(page) => {
                    if let Some(end) = previous {
                        prop_assert!(page.0 > end + 1, "page {} should have extended a range", page.0);
                    }
                    previous = Some(page.0);
                }
                Record::Range(count) => {
                    prop_assert!(count > 0);
                    previous = previous.map(|p| p + count);
                }
                _ => {}
            }
        }
    }
}
