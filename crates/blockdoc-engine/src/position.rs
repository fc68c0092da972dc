//! Viewport tracking for rendered blocks.
//!
//! Geometry is pushed by the presentation layer ([`PositionManager::report`])
//! or pulled on demand from the observed element
//! ([`PositionManager::update_block`]). Nothing here polls.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use crate::block::BlockId;

/// Screen rectangle in presentation units (pixels, terminal cells, ...)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Grow vertically by `margin` on both edges
    pub fn expand_vertical(&self, margin: f64) -> Rect {
        Rect::new(self.x, self.y - margin, self.width, self.height + 2.0 * margin)
    }
}

/// A presentation element that can measure itself on demand
pub trait BlockElement {
    fn measure(&self) -> Option<Rect>;
}

/// Last known geometry of one block
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionRecord {
    pub rect: Option<Rect>,
    pub in_viewport: bool,
}

struct Observation {
    token: u64,
    element: Option<Box<dyn BlockElement>>,
    record: PositionRecord,
}

#[derive(Default)]
struct Registry {
    next_token: u64,
    viewport: Option<Rect>,
    overscan: f64,
    order: Vec<BlockId>,
    observed: HashMap<BlockId, Observation>,
}

impl Registry {
    fn recompute_visibility(&mut self, id: &BlockId) {
        let area = self.viewport.map(|v| v.expand_vertical(self.overscan));
        if let Some(observation) = self.observed.get_mut(id) {
            observation.record.in_viewport = match (area, observation.record.rect) {
                (Some(area), Some(rect)) => area.intersects(&rect),
                _ => false,
            };
        }
    }

    fn remove(&mut self, id: &BlockId, token: u64) {
        let owned = self
            .observed
            .get(id)
            .is_some_and(|observation| observation.token == token);
        if owned {
            self.observed.remove(id);
            self.order.retain(|other| other != id);
        }
    }
}

/// Tracks on-screen rectangles and viewport membership per block
pub struct PositionManager {
    registry: Rc<RefCell<Registry>>,
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl PositionManager {
    /// `overscan` widens the viewport vertically when deciding membership
    pub fn new(overscan: f64) -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry {
                overscan,
                ..Registry::default()
            })),
        }
    }

    /// Start tracking `id`. Dropping the returned handle stops tracking.
    ///
    /// Re-observing an identity replaces the previous element; the previous
    /// handle then becomes inert.
    pub fn observe(&self, id: BlockId, element: Option<Box<dyn BlockElement>>) -> ObserverHandle {
        let mut registry = self.registry.borrow_mut();
        registry.next_token += 1;
        let token = registry.next_token;
        let record = element
            .as_ref()
            .map(|el| PositionRecord {
                rect: el.measure(),
                in_viewport: false,
            })
            .unwrap_or_default();
        if registry
            .observed
            .insert(
                id.clone(),
                Observation {
                    token,
                    element,
                    record,
                },
            )
            .is_none()
        {
            registry.order.push(id.clone());
        }
        registry.recompute_visibility(&id);

        ObserverHandle {
            id,
            token,
            registry: Rc::downgrade(&self.registry),
        }
    }

    /// Push path: the element reports its own geometry
    pub fn report(&self, id: &BlockId, rect: Rect) {
        let mut registry = self.registry.borrow_mut();
        if let Some(observation) = registry.observed.get_mut(id) {
            observation.record.rect = Some(rect);
            registry.recompute_visibility(id);
        }
    }

    /// Pull path: re-measure one block now. Unobserved blocks are ignored.
    pub fn update_block(&self, id: &BlockId) {
        let mut registry = self.registry.borrow_mut();
        if let Some(observation) = registry.observed.get_mut(id) {
            if let Some(element) = &observation.element {
                observation.record.rect = element.measure();
            }
            registry.recompute_visibility(id);
        }
    }

    pub fn set_viewport(&self, viewport: Rect) {
        self.registry.borrow_mut().viewport = Some(viewport);
    }

    /// Recompute membership for every observed block (scroll/resize)
    pub fn update_viewport_blocks(&self) {
        let mut registry = self.registry.borrow_mut();
        let ids = registry.order.clone();
        for id in &ids {
            registry.recompute_visibility(id);
        }
    }

    pub fn get_block_position(&self, id: &BlockId) -> Option<Rect> {
        self.registry
            .borrow()
            .observed
            .get(id)
            .and_then(|observation| observation.record.rect)
    }

    pub fn record(&self, id: &BlockId) -> Option<PositionRecord> {
        self.registry
            .borrow()
            .observed
            .get(id)
            .map(|observation| observation.record)
    }

    pub fn is_in_viewport(&self, id: &BlockId) -> bool {
        self.record(id).is_some_and(|record| record.in_viewport)
    }

    /// Visible identities in observation order
    pub fn blocks_in_viewport(&self) -> Vec<BlockId> {
        let registry = self.registry.borrow();
        registry
            .order
            .iter()
            .filter(|id| {
                registry
                    .observed
                    .get(*id)
                    .is_some_and(|observation| observation.record.in_viewport)
            })
            .cloned()
            .collect()
    }

    pub fn observed_count(&self) -> usize {
        self.registry.borrow().observed.len()
    }

    /// Forget one block regardless of who observes it
    pub fn forget(&self, id: &BlockId) {
        let mut registry = self.registry.borrow_mut();
        registry.observed.remove(id);
        registry.order.retain(|other| other != id);
    }

    /// Release every observer; outstanding handles become inert
    pub fn destroy(&self) {
        let mut registry = self.registry.borrow_mut();
        registry.observed.clear();
        registry.order.clear();
        registry.viewport = None;
    }
}

/// Disposer returned by [`PositionManager::observe`]
pub struct ObserverHandle {
    id: BlockId,
    token: u64,
    registry: Weak<RefCell<Registry>>,
}

impl ObserverHandle {
    pub fn block_id(&self) -> &BlockId {
        &self.id
    }

    /// Explicit form of dropping the handle
    pub fn disconnect(self) {}
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(shared) = self.registry.upgrade()
            && let Ok(mut registry) = shared.try_borrow_mut()
        {
            registry.remove(&self.id, self.token);
        }
    }
}
