//! Shard extraction, context aggregation, and the neighbor graph.
//!
//! Each planned region is cropped into a [`CroppedShard`]. Objects and
//! damage overlapping the region are found through an R-tree and folded
//! into the shard's [`ShardContext`], which also drives its scheduling
//! priority. Shards whose facing edges lie within
//! [`NEIGHBOR_TOLERANCE`] pixels become neighbors in an undirected
//! graph.

use std::collections::BTreeSet;

use petgraph::graph::{NodeIndex, UnGraph};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::RTree;
use serde::{Deserialize, Serialize};

use crate::damage::{DamageRegion, DamageType};
use crate::objects::{DetectedObject, ObjectType};
use crate::types::{DamageId, Rect, RgbaImage, ShardId, crop_rgba};

/// Maximum gap, in pixels, between facing edges of neighboring shards.
pub const NEIGHBOR_TOLERANCE: u32 = 2;

/// Priority of a shard with nothing notable in it.
pub const BASE_PRIORITY: u8 = 5;

/// What a shard contains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardContext {
    /// A text object overlaps the shard.
    pub contains_text: bool,
    /// A damage region overlaps the shard.
    pub contains_damage: bool,
    /// Distinct damage types present.
    pub damage_types: BTreeSet<DamageType>,
    /// Distinct object types present.
    pub object_types: BTreeSet<ObjectType>,
    /// Ids of the overlapping damage regions, in detection order.
    pub damage_ids: Vec<DamageId>,
    /// Adjacent shards.
    pub neighbor_ids: Vec<ShardId>,
    /// Bounds at extraction time.
    pub original_bounds: Rect,
}

impl ShardContext {
    /// Scheduling priority implied by the context.
    ///
    /// Base 5; at least 8 with text; at least 7 with damage; 9 with a
    /// tear, a stain, or a face.
    #[must_use]
    pub fn priority(&self) -> u8 {
        let mut p = BASE_PRIORITY;
        if self.contains_text {
            p = p.max(8);
        }
        if self.contains_damage {
            p = p.max(7);
        }
        let critical_damage = self.damage_types.contains(&DamageType::Tear)
            || self.damage_types.contains(&DamageType::Stain);
        if critical_damage || self.object_types.contains(&ObjectType::Face) {
            p = p.max(9);
        }
        p
    }
}

/// A sub-raster scheduled for restoration.
///
/// The pixels are replaced during restoration; the id, bounds, and
/// context are fixed at extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct CroppedShard {
    id: ShardId,
    bounds: Rect,
    priority: u8,
    context: ShardContext,
    /// Shard pixels, `bounds.width × bounds.height`.
    pub image: RgbaImage,
}

impl CroppedShard {
    /// Cut a shard with an empty context from `source`.
    #[must_use]
    pub fn from_source(id: ShardId, source: &RgbaImage, bounds: Rect) -> Self {
        let context = ShardContext {
            original_bounds: bounds,
            ..ShardContext::default()
        };
        Self {
            id,
            bounds,
            priority: context.priority(),
            context,
            image: crop_rgba(source, bounds),
        }
    }

    /// Identifier, assigned in region order.
    #[must_use]
    pub const fn id(&self) -> ShardId {
        self.id
    }

    /// Bounds in source-raster coordinates.
    #[must_use]
    pub const fn bounds(&self) -> Rect {
        self.bounds
    }

    /// Scheduling priority.
    #[must_use]
    pub const fn priority(&self) -> u8 {
        self.priority
    }

    /// Aggregated context.
    #[must_use]
    pub const fn context(&self) -> &ShardContext {
        &self.context
    }
}

type Indexed = GeomWithData<Rectangle<[i64; 2]>, usize>;

/// R-tree over non-empty boxes, carrying their slice index. Corners are
/// inclusive pixel coordinates, so closed-box intersection means a
/// shared pixel.
fn box_tree(boxes: &[Rect]) -> RTree<Indexed> {
    let items = boxes
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.is_empty())
        .map(|(i, r)| {
            GeomWithData::new(
                Rectangle::from_corners(
                    [i64::from(r.x), i64::from(r.y)],
                    [i64::from(r.right()) - 1, i64::from(r.bottom()) - 1],
                ),
                i,
            )
        })
        .collect();
    RTree::bulk_load(items)
}

/// For each region, the ascending indices of the boxes sharing at least
/// one pixel with it.
fn overlapping(regions: &[Rect], boxes: &[Rect]) -> Vec<Vec<usize>> {
    let mut out = vec![Vec::new(); regions.len()];
    let region_tree = box_tree(regions);
    let other = box_tree(boxes);
    for (r, b) in region_tree.intersection_candidates_with_other_tree(&other) {
        if regions[r.data].intersects(&boxes[b.data]) {
            out[r.data].push(b.data);
        }
    }
    for hits in &mut out {
        hits.sort_unstable();
    }
    out
}

/// Crop every region into a shard, attach context and neighbors, and
/// sort by priority (highest first, ties in region order).
#[must_use]
#[tracing::instrument(skip_all, fields(regions = regions.len()))]
pub fn extract_shards(
    source: &RgbaImage,
    regions: &[Rect],
    objects: &[DetectedObject],
    damages: &[DamageRegion],
) -> Vec<CroppedShard> {
    let object_boxes: Vec<Rect> = objects.iter().map(|o| o.bounds).collect();
    let damage_boxes: Vec<Rect> = damages.iter().map(|d| d.bounds).collect();
    let object_hits = overlapping(regions, &object_boxes);
    let damage_hits = overlapping(regions, &damage_boxes);

    let mut shards: Vec<CroppedShard> = regions
        .iter()
        .enumerate()
        .map(|(i, &bounds)| {
            let mut context = ShardContext {
                original_bounds: bounds,
                ..ShardContext::default()
            };
            for &oi in &object_hits[i] {
                let o = &objects[oi];
                context.contains_text |= o.object_type == ObjectType::Text;
                context.object_types.insert(o.object_type);
            }
            for &di in &damage_hits[i] {
                let d = &damages[di];
                context.contains_damage = true;
                context.damage_types.insert(d.damage_type);
                context.damage_ids.push(d.id);
            }
            #[allow(clippy::cast_possible_truncation)]
            let id = ShardId(i as u32);
            CroppedShard {
                id,
                bounds,
                priority: context.priority(),
                context,
                image: crop_rgba(source, bounds),
            }
        })
        .collect();

    let graph = neighbor_graph(&shards.iter().map(CroppedShard::bounds).collect::<Vec<_>>());
    for (i, shard) in shards.iter_mut().enumerate() {
        let mut ids: Vec<ShardId> = graph
            .neighbors(NodeIndex::new(i))
            .map(|n| ShardId(graph[n]))
            .collect();
        ids.sort_unstable();
        shard.context.neighbor_ids = ids;
    }

    shards.sort_by(|a, b| b.priority.cmp(&a.priority));
    tracing::debug!(
        shards = shards.len(),
        edges = graph.edge_count(),
        "shards extracted"
    );
    shards
}

/// Whether two boxes are neighbors: the gap between a pair of facing
/// edges is at most [`NEIGHBOR_TOLERANCE`] and the boxes overlap along
/// the other axis.
#[must_use]
pub fn are_neighbors(a: Rect, b: Rect) -> bool {
    let overlaps = |a0: u32, a1: u32, b0: u32, b1: u32| a0 < b1 && b0 < a1;
    let gap = |a_end: u32, b_start: u32| a_end.abs_diff(b_start) <= NEIGHBOR_TOLERANCE;
    let horizontal = (gap(a.right(), b.x) || gap(b.right(), a.x))
        && overlaps(a.y, a.bottom(), b.y, b.bottom());
    let vertical = (gap(a.bottom(), b.y) || gap(b.bottom(), a.y))
        && overlaps(a.x, a.right(), b.x, b.right());
    horizontal || vertical
}

/// Undirected adjacency graph. Node `i` corresponds to `bounds[i]` and
/// carries its index as weight.
#[must_use]
pub fn neighbor_graph(bounds: &[Rect]) -> UnGraph<u32, ()> {
    let mut graph = UnGraph::<u32, ()>::with_capacity(bounds.len(), bounds.len() * 2);
    #[allow(clippy::cast_possible_truncation)]
    let nodes: Vec<NodeIndex> = (0..bounds.len()).map(|i| graph.add_node(i as u32)).collect();
    for i in 0..bounds.len() {
        for j in i + 1..bounds.len() {
            if are_neighbors(bounds[i], bounds[j]) {
                graph.add_edge(nodes[i], nodes[j], ());
            }
        }
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;

    use image::{GrayImage, Rgba};

    use crate::damage::Severity;
    use crate::types::ObjectId;

    fn object(id: u32, object_type: ObjectType, bounds: Rect) -> DetectedObject {
        DetectedObject {
            id: ObjectId(id),
            object_type,
            bounds,
            confidence: 0.8,
            priority: object_type.priority(),
        }
    }

    fn damage(id: u32, damage_type: DamageType, bounds: Rect) -> DamageRegion {
        DamageRegion {
            id: DamageId(id),
            damage_type,
            bounds,
            severity: Severity::Low,
            mask: GrayImage::new(bounds.width, bounds.height),
            area: bounds.area(),
            confidence: 0.9,
        }
    }

    fn quadrants() -> Vec<Rect> {
        vec![
            Rect::new(0, 0, 50, 50),
            Rect::new(50, 0, 50, 50),
            Rect::new(0, 50, 50, 50),
            Rect::new(50, 50, 50, 50),
        ]
    }

    #[test]
    fn priority_rules() {
        let mut ctx = ShardContext::default();
        assert_eq!(ctx.priority(), 5);
        ctx.contains_damage = true;
        ctx.damage_types.insert(DamageType::Noise);
        assert_eq!(ctx.priority(), 7);
        ctx.contains_text = true;
        assert_eq!(ctx.priority(), 8);
        ctx.damage_types.insert(DamageType::Stain);
        assert_eq!(ctx.priority(), 9);

        let face = ShardContext {
            object_types: BTreeSet::from([ObjectType::Face]),
            ..ShardContext::default()
        };
        assert_eq!(face.priority(), 9);
    }

    #[test]
    fn neighbors_need_facing_edges_and_overlap() {
        let a = Rect::new(0, 0, 50, 50);
        assert!(are_neighbors(a, Rect::new(50, 0, 50, 50)));
        assert!(are_neighbors(a, Rect::new(52, 10, 20, 20)));
        assert!(!are_neighbors(a, Rect::new(53, 10, 20, 20)));
        assert!(are_neighbors(a, Rect::new(10, 51, 10, 10)));
        // Diagonal: edges meet only at a corner.
        assert!(!are_neighbors(a, Rect::new(50, 50, 50, 50)));
    }

    #[test]
    fn quadrant_graph_is_a_cycle() {
        let graph = neighbor_graph(&quadrants());
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.edge_count(), 4);
    }

    #[test]
    fn shards_carry_context_and_sort_by_priority() {
        let source = RgbaImage::from_fn(100, 100, |x, y| Rgba([x as u8, y as u8, 0, 255]));
        let objects = [object(0, ObjectType::Text, Rect::new(60, 60, 10, 10))];
        let damages = [
            damage(0, DamageType::Noise, Rect::new(10, 60, 5, 5)),
            damage(1, DamageType::Stain, Rect::new(70, 5, 5, 5)),
        ];
        let shards = extract_shards(&source, &quadrants(), &objects, &damages);
        let order: Vec<(ShardId, u8)> = shards.iter().map(|s| (s.id(), s.priority())).collect();
        assert_eq!(
            order,
            vec![
                (ShardId(1), 9),
                (ShardId(3), 8),
                (ShardId(2), 7),
                (ShardId(0), 5),
            ]
        );

        let stained = &shards[0];
        assert_eq!(stained.context().damage_ids, vec![DamageId(1)]);
        assert_eq!(stained.context().neighbor_ids, vec![ShardId(0), ShardId(3)]);
        assert_eq!(stained.image.dimensions(), (50, 50));
        assert_eq!(stained.image.get_pixel(0, 0), &Rgba([50, 0, 0, 255]));
        assert!(shards[1].context().contains_text);
    }

    #[test]
    fn touching_boxes_do_not_overlap() {
        let boxes = quadrants();
        let regions = [
            Rect::new(0, 0, 50, 50),
            Rect::new(49, 49, 2, 2),
            Rect::new(0, 0, 0, 0),
        ];
        let hits = overlapping(&regions, &boxes);
        assert_eq!(hits, vec![vec![0], vec![0, 1, 2, 3], vec![]]);
    }
}
