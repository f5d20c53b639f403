use crate::dataset::{Category, Dataset};
use std::collections::HashMap;

/// Categories of several datasets unified by name, plus per-source id remaps.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryUnion {
    categories: Vec<Category>,
    remaps: Vec<HashMap<u32, u32>>,
}

impl CategoryUnion {
    /// Names are coalesced in source order; unified ids are dense in
    /// first-seen order.
    pub fn build(sources: &[Dataset]) -> Self {
        let mut categories: Vec<Category> = Vec::new();
        let mut by_name: HashMap<String, u32> = HashMap::new();
        let mut remaps = Vec::with_capacity(sources.len());

        for source in sources {
            let mut remap = HashMap::new();
            for category in source.categories() {
                let unified = *by_name.entry(category.name.clone()).or_insert_with(|| {
                    let id = categories.len() as u32;
                    categories.push(Category::new(id, category.name.clone()));
                    id
                });
                remap.insert(category.id, unified);
            }
            remaps.push(remap);
        }

        Self { categories, remaps }
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Unified id of `label_id` from source `source`.
    pub fn map(&self, source: usize, label_id: u32) -> Option<u32> {
        self.remaps.get(source)?.get(&label_id).copied()
    }
}
