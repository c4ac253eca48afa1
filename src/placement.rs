//! Process placement: which ranks are clients, which are servers, and which
//! server each client forwards to.
//!
//! Clients form a `client_x` x `client_y` grid occupying ranks
//! `0..client_amount`. The server grid is chosen so that each server owns an
//! equal rectangular block of clients; servers occupy the ranks directly after
//! the clients, and any remaining ranks are idle.

use crate::error::{IdKind, IofwdError, IofwdResult};

/// Relative error above which a factor pair is rejected as a poor fit.
const MAX_RELATIVE_ERROR: f64 = 0.4;

/// Role of a rank in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Client,
    Server,
    Idle,
}

/// Server grid dimensions. `x` divides `client_x`, `y` divides `client_y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerGrid {
    pub x: usize,
    pub y: usize,
}

impl ServerGrid {
    pub fn amount(&self) -> usize {
        self.x * self.y
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    client_x: usize,
    client_y: usize,
    grid: ServerGrid,
    world_size: usize,
}

/// All divisors of `n` in ascending order.
pub fn factors(n: usize) -> Vec<usize> {
    let mut low = Vec::new();
    let mut high = Vec::new();
    let mut i = 1;
    while i * i <= n {
        if n % i == 0 {
            low.push(i);
            if i != n / i {
                high.push(n / i);
            }
        }
        i += 1;
    }
    low.extend(high.into_iter().rev());
    low
}

/// Pick `(fx, fy)` with `fx | client_x`, `fy | client_y` and `fx * fy` as close
/// as possible to `desired`.
///
/// The search walks the x divisors upward and the y divisors downward, moving
/// whichever side brings the product toward `desired`. The first pair seen
/// with the smallest distance wins; an exact hit stops the walk.
fn closest_factor_pair(client_x: usize, client_y: usize, desired: usize) -> (usize, usize, usize) {
    let fx = factors(client_x);
    let fy = factors(client_y);

    let mut best = (fx[0], fy[fy.len() - 1]);
    let mut min_diff = usize::MAX;

    let mut ix = 0usize;
    let mut iy = fy.len();
    while ix < fx.len() && iy > 0 {
        let product = fx[ix] * fy[iy - 1];
        let diff = product.abs_diff(desired);
        if diff < min_diff {
            min_diff = diff;
            best = (fx[ix], fy[iy - 1]);
        }
        if product == desired {
            break;
        } else if product < desired {
            ix += 1;
        } else {
            iy -= 1;
        }
    }

    (best.0, best.1, min_diff)
}

impl Placement {
    /// Build a placement for a `client_x` x `client_y` client grid in a world of
    /// `world_size` ranks, aiming for one server per `ratio` clients.
    pub fn new(client_x: usize, client_y: usize, ratio: usize, world_size: usize) -> IofwdResult<Self> {
        if client_x == 0 || client_y == 0 {
            return Err(IofwdError::InvalidPlacement(format!(
                "client grid {}x{} is empty",
                client_x, client_y
            )));
        }
        if ratio == 0 {
            return Err(IofwdError::InvalidPlacement(
                "client to server ratio must be positive".to_string(),
            ));
        }

        let client_amount = client_x * client_y;
        if world_size < client_amount {
            return Err(IofwdError::InvalidPlacement(format!(
                "world of {} ranks cannot hold {} clients",
                world_size, client_amount
            )));
        }
        let available = world_size - client_amount;
        let desired = (client_amount / ratio).max(1);

        let (x, y, diff) = closest_factor_pair(client_x, client_y, desired);
        if diff as f64 / desired as f64 >= MAX_RELATIVE_ERROR {
            return Err(IofwdError::InvalidPlacement(format!(
                "no server grid close to {} servers for a {}x{} client grid (closest {}x{})",
                desired, client_x, client_y, x, y
            )));
        }

        let grid = ServerGrid { x, y };
        if available < grid.amount() {
            return Err(IofwdError::InvalidPlacement(format!(
                "server grid {}x{} needs {} ranks, only {} available",
                x,
                y,
                grid.amount(),
                available
            )));
        }

        tracing::debug!(
            "Placement: clients {}x{}, servers {}x{}, idle {}",
            client_x,
            client_y,
            x,
            y,
            available - grid.amount()
        );

        Ok(Self {
            client_x,
            client_y,
            grid,
            world_size,
        })
    }

    pub fn client_x(&self) -> usize {
        self.client_x
    }

    pub fn client_y(&self) -> usize {
        self.client_y
    }

    pub fn client_amount(&self) -> usize {
        self.client_x * self.client_y
    }

    pub fn server_amount(&self) -> usize {
        self.grid.amount()
    }

    pub fn server_grid(&self) -> ServerGrid {
        self.grid
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Clients in each server's block.
    pub fn clients_per_server(&self) -> usize {
        self.block_x() * self.block_y()
    }

    fn block_x(&self) -> usize {
        self.client_x / self.grid.x
    }

    fn block_y(&self) -> usize {
        self.client_y / self.grid.y
    }

    pub fn role(&self, rank: usize) -> IofwdResult<ProcessRole> {
        if rank < self.client_amount() {
            Ok(ProcessRole::Client)
        } else if rank < self.client_amount() + self.server_amount() {
            Ok(ProcessRole::Server)
        } else if rank < self.world_size {
            Ok(ProcessRole::Idle)
        } else {
            Err(IofwdError::unknown(IdKind::Rank, rank))
        }
    }

    fn client_coords(&self, client_rank: usize) -> IofwdResult<(usize, usize)> {
        if client_rank >= self.client_amount() {
            return Err(IofwdError::unknown(IdKind::Client, client_rank));
        }
        Ok((client_rank % self.client_x, client_rank / self.client_x))
    }

    /// Position of a server in the server grid, row-major.
    pub fn server_index(&self, server_rank: usize) -> IofwdResult<usize> {
        server_rank
            .checked_sub(self.client_amount())
            .filter(|index| *index < self.server_amount())
            .ok_or_else(|| IofwdError::unknown(IdKind::Rank, server_rank))
    }

    /// Rank of the server a client forwards to.
    pub fn server_of_client(&self, client_rank: usize) -> IofwdResult<usize> {
        let (cx, cy) = self.client_coords(client_rank)?;
        let index = cx / self.block_x() + (cy / self.block_y()) * self.grid.x;
        Ok(index + self.client_amount())
    }

    /// Position of a client within its server's block, row-major. Used as the
    /// bit index in completion bitmaps and the slot index for contributions.
    pub fn client_index_of_server(&self, client_rank: usize) -> IofwdResult<usize> {
        let (cx, cy) = self.client_coords(client_rank)?;
        Ok(cx % self.block_x() + (cy % self.block_y()) * self.block_x())
    }

    /// Client ranks served by `server_rank`, ordered by their index within the
    /// block.
    pub fn clients_of_server(&self, server_rank: usize) -> IofwdResult<Vec<usize>> {
        let index = self.server_index(server_rank)?;
        let (sx, sy) = (index % self.grid.x, index / self.grid.x);
        let (bx, by) = (self.block_x(), self.block_y());

        let mut clients = Vec::with_capacity(bx * by);
        for j in 0..by {
            for i in 0..bx {
                let cx = sx * bx + i;
                let cy = sy * by + j;
                clients.push(cy * self.client_x + cx);
            }
        }
        Ok(clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factors() {
        assert_eq!(factors(1), vec![1]);
        assert_eq!(factors(4), vec![1, 2, 4]);
        assert_eq!(factors(12), vec![1, 2, 3, 4, 6, 12]);
        assert_eq!(factors(7), vec![1, 7]);
    }

    #[test]
    fn test_four_by_four_ratio_eight() {
        let placement = Placement::new(4, 4, 8, 18).unwrap();
        assert_eq!(placement.server_amount(), 2);
        assert_eq!(placement.server_grid(), ServerGrid { x: 1, y: 2 });
        assert_eq!(placement.clients_per_server(), 8);

        assert_eq!(placement.role(0).unwrap(), ProcessRole::Client);
        assert_eq!(placement.role(15).unwrap(), ProcessRole::Client);
        assert_eq!(placement.role(16).unwrap(), ProcessRole::Server);
        assert_eq!(placement.role(17).unwrap(), ProcessRole::Server);
        assert!(placement.role(18).is_err());

        // Top two rows go to server 16, bottom two to 17.
        assert_eq!(placement.server_of_client(0).unwrap(), 16);
        assert_eq!(placement.server_of_client(7).unwrap(), 16);
        assert_eq!(placement.server_of_client(8).unwrap(), 17);
        assert_eq!(placement.server_of_client(15).unwrap(), 17);
        assert_eq!(placement.client_index_of_server(9).unwrap(), 1);
    }

    #[test]
    fn test_high_ratio_collapses_to_one_server() {
        let placement = Placement::new(3, 3, 100, 10).unwrap();
        assert_eq!(placement.server_grid(), ServerGrid { x: 1, y: 1 });
        assert_eq!(placement.clients_of_server(9).unwrap(), (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_extra_ranks_are_idle() {
        let placement = Placement::new(2, 2, 4, 8).unwrap();
        assert_eq!(placement.server_amount(), 1);
        assert_eq!(placement.role(4).unwrap(), ProcessRole::Server);
        assert_eq!(placement.role(5).unwrap(), ProcessRole::Idle);
        assert_eq!(placement.role(7).unwrap(), ProcessRole::Idle);
    }

    #[test]
    fn test_not_enough_server_ranks() {
        let err = Placement::new(4, 4, 4, 17).unwrap_err();
        assert!(matches!(err, IofwdError::InvalidPlacement(_)));
    }

    #[test]
    fn test_poor_factorization_rejected() {
        // 7x1 clients, ratio 2: desired 3, closest divisor product is 1 or 7.
        let err = Placement::new(7, 1, 2, 20).unwrap_err();
        assert!(matches!(err, IofwdError::InvalidPlacement(_)));
    }

    #[test]
    fn test_client_mapping_is_consistent() {
        let placement = Placement::new(6, 4, 3, 40).unwrap();
        let per_server = placement.clients_per_server();
        let first_server = placement.client_amount();

        for server in first_server..first_server + placement.server_amount() {
            let clients = placement.clients_of_server(server).unwrap();
            assert_eq!(clients.len(), per_server);
            for (index, client) in clients.iter().enumerate() {
                assert_eq!(placement.server_of_client(*client).unwrap(), server);
                assert_eq!(placement.client_index_of_server(*client).unwrap(), index);
            }
        }
    }

    #[test]
    fn test_unknown_ranks() {
        let placement = Placement::new(2, 2, 4, 5).unwrap();
        assert!(placement.server_of_client(4).is_err());
        assert!(placement.clients_of_server(0).is_err());
        assert!(placement.clients_of_server(5).is_err());
    }
}
