use nalgebra::Vector3;
use ndarray::prelude::*;
use ordered_float::NotNan;
use std::collections::BinaryHeap;

const LEAF_SIZE: usize = 16;

enum Node {
    Leaf {
        points: Array1<Vector3<f32>>,
        indices: Vec<usize>,
    },
    NonLeaf {
        middle_value: f32,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// KdTree over 3D points for nearest neighbor queries.
///
/// Splits cycle through x, y, z by depth, at the median of the splitting
/// coordinate. Queries backtrack across the splitting plane, so results are
/// exact nearest neighbors.
pub struct R3dTree {
    root: Box<Node>,
    len: usize,
}

/// Max-heap entry holding the current k-nearest candidates; the heap top is
/// the worst kept distance.
type Candidates = BinaryHeap<(NotNan<f32>, usize)>;

impl R3dTree {
    /// Create a new KdTree from a set of points.
    pub fn new(points: &ArrayView1<Vector3<f32>>) -> Self {
        // Recursive creation.
        fn rec(points: &ArrayView1<Vector3<f32>>, mut indices: Vec<usize>, depth: usize) -> Node {
            // Stop recursion if this should be a leaf node.
            if indices.len() <= LEAF_SIZE {
                return Node::Leaf {
                    points: points.select(ndarray::Axis(0), &indices),
                    indices,
                };
            }

            let k = depth % 3;
            indices.sort_by(|idx1, idx2| {
                let a = points[*idx1][k];
                let b = points[*idx2][k];
                a.partial_cmp(&b).unwrap()
            });

            let mid = indices.len() / 2;
            Node::NonLeaf {
                middle_value: points[indices[mid]][k],
                left: Box::new(rec(points, indices[0..mid].to_vec(), depth + 1)),
                right: Box::new(rec(points, indices[mid..].to_vec(), depth + 1)),
            }
        }

        let indices = Vec::from_iter(0..points.shape()[0]);
        Self {
            root: Box::new(rec(points, indices, 0)),
            len: points.shape()[0],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Find the nearest neighbor to a query point.
    ///
    /// Returns the index of the nearest point and the squared distance to
    /// it, or `None` when the tree is empty.
    pub fn nearest(&self, point: &Vector3<f32>) -> Option<(usize, f32)> {
        let mut heap = Candidates::new();
        search(&self.root, point, 0, 1, f32::INFINITY, &mut heap);
        heap.pop()
            .map(|(distance, index)| (index, distance.into_inner()))
    }

    /// Find the `k` nearest neighbors, sorted by ascending squared distance.
    pub fn knearest(&self, point: &Vector3<f32>, k: usize) -> Vec<(usize, f32)> {
        self.collect_sorted(point, k, f32::INFINITY)
    }

    /// Hybrid radius/KNN query: at most `max_nn` neighbors within `radius`,
    /// sorted by ascending squared distance.
    pub fn radius_knearest(
        &self,
        point: &Vector3<f32>,
        radius: f32,
        max_nn: usize,
    ) -> Vec<(usize, f32)> {
        self.collect_sorted(point, max_nn, radius * radius)
    }

    fn collect_sorted(&self, point: &Vector3<f32>, k: usize, max_sqr: f32) -> Vec<(usize, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let mut heap = Candidates::new();
        search(&self.root, point, 0, k, max_sqr, &mut heap);

        let mut found: Vec<(usize, f32)> = heap
            .into_iter()
            .map(|(distance, index)| (index, distance.into_inner()))
            .collect();
        found.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        found
    }
}

fn search(
    node: &Node,
    point: &Vector3<f32>,
    depth: usize,
    k: usize,
    max_sqr: f32,
    heap: &mut Candidates,
) {
    // The pruning bound shrinks from the radius cap to the worst kept
    // candidate once the heap is full.
    let bound = |heap: &Candidates| {
        if heap.len() < k {
            max_sqr
        } else {
            heap.peek().map_or(max_sqr, |(d, _)| d.into_inner())
        }
    };

    match node {
        Node::Leaf { points, indices } => {
            for (leaf_point, index) in points.iter().zip(indices.iter()) {
                let distance = (point - leaf_point).norm_squared();
                if distance <= bound(heap) {
                    // Finite by contract: the preprocessor drops non-finite points.
                    heap.push((NotNan::new(distance).unwrap(), *index));
                    if heap.len() > k {
                        heap.pop();
                    }
                }
            }
        }
        Node::NonLeaf {
            middle_value,
            left,
            right,
        } => {
            let diff = point[depth % 3] - middle_value;
            let (near, far) = if diff < 0.0 {
                (left, right)
            } else {
                (right, left)
            };

            search(near, point, depth + 1, k, max_sqr, heap);
            if diff * diff <= bound(heap) {
                search(far, point, depth + 1, k, max_sqr, heap);
            }
        }
    }
}
