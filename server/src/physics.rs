//! Rigid body integration and sphere-sphere contact detection for the arena
//! simulation.

use shared::math::{Quat, Vec3};

/// Stable handle to a body inside a [`PhysicsWorld`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyId(usize);

/// A simulated rigid body. Bodies with zero mass are static: they collide but
/// never move.
#[derive(Debug, Clone)]
pub struct Body {
    pub position: Vec3,
    pub rotation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub mass: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub radius: f32,
    force: Vec3,
    torque: Vec3,
}

impl Body {
    pub fn new(position: Vec3, rotation: Quat, mass: f32, radius: f32) -> Self {
        Self {
            position,
            rotation,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            mass,
            linear_damping: 0.0,
            angular_damping: 0.0,
            radius,
            force: Vec3::ZERO,
            torque: Vec3::ZERO,
        }
    }

    pub fn is_static(&self) -> bool {
        self.mass <= 0.0
    }
}

/// A contact between two bodies reported by one integration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub first: BodyId,
    pub second: BodyId,
}

/// All bodies of one arena. Slots are recycled, so a [`BodyId`] is only valid
/// until the body it names is removed.
#[derive(Debug, Default)]
pub struct PhysicsWorld {
    bodies: Vec<Option<Body>>,
    free: Vec<usize>,
}

impl PhysicsWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_body(&mut self, body: Body) -> BodyId {
        match self.free.pop() {
            Some(slot) => {
                self.bodies[slot] = Some(body);
                BodyId(slot)
            }
            None => {
                self.bodies.push(Some(body));
                BodyId(self.bodies.len() - 1)
            }
        }
    }

    pub fn remove_body(&mut self, id: BodyId) {
        if let Some(slot) = self.bodies.get_mut(id.0) {
            if slot.take().is_some() {
                self.free.push(id.0);
            }
        }
    }

    pub fn body(&self, id: BodyId) -> Option<&Body> {
        self.bodies.get(id.0).and_then(Option::as_ref)
    }

    pub fn body_mut(&mut self, id: BodyId) -> Option<&mut Body> {
        self.bodies.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Accumulates a force (world axes) applied until the next step.
    pub fn apply_force(&mut self, id: BodyId, force: Vec3) {
        if let Some(body) = self.body_mut(id) {
            body.force += force;
        }
    }

    /// Accumulates a torque (world axes) applied until the next step.
    pub fn apply_torque(&mut self, id: BodyId, torque: Vec3) {
        if let Some(body) = self.body_mut(id) {
            body.torque += torque;
        }
    }

    /// Applies an instantaneous velocity change of `impulse / mass`.
    pub fn apply_impulse(&mut self, id: BodyId, impulse: Vec3) {
        if let Some(body) = self.body_mut(id) {
            if !body.is_static() {
                body.linear_velocity += impulse * (1.0 / body.mass);
            }
        }
    }

    /// Advances every body by `dt` seconds and returns the contacts found at
    /// the new positions.
    pub fn step(&mut self, dt: f32) -> Vec<Contact> {
        for slot in self.bodies.iter_mut() {
            let Some(body) = slot.as_mut() else { continue };
            if body.is_static() {
                body.force = Vec3::ZERO;
                body.torque = Vec3::ZERO;
                continue;
            }

            let inv_mass = 1.0 / body.mass;
            body.linear_velocity += body.force * (inv_mass * dt);
            body.angular_velocity += body.torque * (inv_mass * dt);

            // Exponential damping, matching a drag force proportional to
            // velocity.
            let linear_decay = (-body.linear_damping * dt).exp();
            let angular_decay = (-body.angular_damping * dt).exp();
            body.linear_velocity = body.linear_velocity * linear_decay;
            body.angular_velocity = body.angular_velocity * angular_decay;

            body.position += body.linear_velocity * dt;
            body.rotation = body.rotation.integrate(body.angular_velocity, dt);

            body.force = Vec3::ZERO;
            body.torque = Vec3::ZERO;
        }

        self.find_contacts()
    }

    fn find_contacts(&self) -> Vec<Contact> {
        let mut contacts = Vec::new();

        let live: Vec<(usize, &Body)> = self
            .bodies
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|b| (i, b)))
            .collect();

        for (n, &(i, a)) in live.iter().enumerate() {
            for &(j, b) in &live[n + 1..] {
                if a.is_static() && b.is_static() {
                    continue;
                }

                let reach = a.radius + b.radius;
                if a.position.distance_squared(b.position) <= reach * reach {
                    contacts.push(Contact {
                        first: BodyId(i),
                        second: BodyId(j),
                    });
                }
            }
        }

        contacts
    }

    /// Handles of every body whose sphere overlaps the given sphere.
    pub fn bodies_within(&self, center: Vec3, radius: f32) -> Vec<BodyId> {
        self.bodies
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let body = slot.as_ref()?;
                let reach = radius + body.radius;
                (body.position.distance_squared(center) <= reach * reach).then_some(BodyId(i))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_body_moves_with_velocity() {
        let mut world = PhysicsWorld::new();
        let mut body = Body::new(Vec3::ZERO, Quat::IDENTITY, 1.0, 1.0);
        body.linear_velocity = Vec3::new(2.0, 0.0, 0.0);
        let id = world.create_body(body);

        world.step(0.5);

        assert_approx_eq!(world.body(id).unwrap().position.x, 1.0, 1e-5);
    }

    #[test]
    fn test_force_accelerates_by_mass() {
        let mut world = PhysicsWorld::new();
        let id = world.create_body(Body::new(Vec3::ZERO, Quat::IDENTITY, 2.0, 1.0));

        world.apply_force(id, Vec3::new(4.0, 0.0, 0.0));
        world.step(1.0);

        // a = F/m = 2, integrated over one second.
        assert_approx_eq!(world.body(id).unwrap().linear_velocity.x, 2.0, 1e-5);

        // Forces are cleared after the step.
        world.step(1.0);
        assert_approx_eq!(world.body(id).unwrap().linear_velocity.x, 2.0, 1e-5);
    }

    #[test]
    fn test_damping_slows_body() {
        let mut world = PhysicsWorld::new();
        let mut body = Body::new(Vec3::ZERO, Quat::IDENTITY, 1.0, 1.0);
        body.linear_velocity = Vec3::new(10.0, 0.0, 0.0);
        body.linear_damping = 0.25;
        let id = world.create_body(body);

        for _ in 0..60 {
            world.step(1.0 / 60.0);
        }

        let speed = world.body(id).unwrap().linear_velocity.length();
        assert!(speed < 10.0);
        assert!(speed > 5.0);
    }

    #[test]
    fn test_static_body_never_moves() {
        let mut world = PhysicsWorld::new();
        let id = world.create_body(Body::new(Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY, 0.0, 5.0));

        world.apply_force(id, Vec3::new(100.0, 0.0, 0.0));
        world.step(1.0);

        assert_eq!(world.body(id).unwrap().position, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_sphere_contact_detection() {
        let mut world = PhysicsWorld::new();
        let a = world.create_body(Body::new(Vec3::ZERO, Quat::IDENTITY, 1.0, 1.0));
        let b = world.create_body(Body::new(Vec3::new(1.5, 0.0, 0.0), Quat::IDENTITY, 1.0, 1.0));
        let far = world.create_body(Body::new(Vec3::new(50.0, 0.0, 0.0), Quat::IDENTITY, 1.0, 1.0));

        let contacts = world.step(0.0);

        assert_eq!(contacts, vec![Contact { first: a, second: b }]);
        assert!(world.body(far).is_some());
    }

    #[test]
    fn test_removed_slot_is_recycled() {
        let mut world = PhysicsWorld::new();
        let a = world.create_body(Body::new(Vec3::ZERO, Quat::IDENTITY, 1.0, 1.0));
        world.remove_body(a);
        assert!(world.body(a).is_none());

        let b = world.create_body(Body::new(Vec3::UP, Quat::IDENTITY, 1.0, 1.0));
        assert!(world.body(b).is_some());
    }

    #[test]
    fn test_impulse_changes_velocity() {
        let mut world = PhysicsWorld::new();
        let id = world.create_body(Body::new(Vec3::ZERO, Quat::IDENTITY, 4.0, 1.0));

        world.apply_impulse(id, Vec3::new(8.0, 0.0, 0.0));

        assert_approx_eq!(world.body(id).unwrap().linear_velocity.x, 2.0, 1e-6);
    }
}
