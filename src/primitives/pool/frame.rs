use crate::types::PageTag;

pub struct Frame {
    pub tag: Option<PageTag>,
    pub reference: bool,
    pub buf: Box<[u8]>,
}

impl Frame {
    pub fn new(page_size: usize) -> Self {
        Self {
            tag: None,
            reference: false,
            buf: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.tag.is_some()
    }
}
