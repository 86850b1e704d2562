// Scene geometry
//
// A mesh is a triangle list; instances place meshes in the world.

use glam::Affine3A;

#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct Instance {
    /// Index into `Scene::meshes`
    pub mesh: usize,
    pub transform: Affine3A,
}

#[derive(Debug, Clone)]
pub struct Scene {
    pub meshes: Vec<Mesh>,
    pub instances: Vec<Instance>,
}

impl Default for Scene {
    /// One triangle in the z = 0 plane, placed once at the origin
    fn default() -> Self {
        let triangle = Mesh {
            vertices: vec![[0.25, 0.25, 0.0], [0.75, 0.25, 0.0], [0.5, 0.75, 0.0]],
            indices: vec![0, 1, 2],
        };

        Self {
            meshes: vec![triangle],
            instances: vec![Instance {
                mesh: 0,
                transform: Affine3A::IDENTITY,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scene_is_one_triangle() {
        let scene = Scene::default();
        assert_eq!(scene.meshes.len(), 1);
        assert_eq!(scene.meshes[0].indices.len(), 3);
        assert_eq!(scene.instances.len(), 1);
        assert_eq!(scene.instances[0].transform, Affine3A::IDENTITY);
    }

    #[test]
    fn instances_reference_existing_meshes() {
        let scene = Scene::default();
        for instance in &scene.instances {
            assert!(instance.mesh < scene.meshes.len());
        }
    }

    #[test]
    fn indices_stay_in_range() {
        for mesh in Scene::default().meshes {
            assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
        }
    }
}
