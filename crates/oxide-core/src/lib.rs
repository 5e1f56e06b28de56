use std::fs;
use std::path::Path;
use thiserror::Error;

// ============================================================================
//  CONTRACTS (TRAITS)
// ============================================================================

/// Vista del banco de registros de un 68000 que necesitan los hooks.
///
/// El intérprete es externo: aquí sólo exponemos lo que el núcleo de
/// emulación lee o reescribe (PC, registros de datos y direcciones).
pub trait Cpu {
    /// Program Counter actual
    fn pc(&self) -> u32;
    fn set_pc(&mut self, pc: u32);

    fn d(&self, reg: usize) -> u32;
    fn a(&self, reg: usize) -> u32;
    fn set_a(&mut self, reg: usize, val: u32);

    /// A7 activo (USP o SSP según el modo)
    fn sp(&self) -> u32 {
        self.a(7)
    }
    fn set_sp(&mut self, val: u32) {
        self.set_a(7, val);
    }
}

/// Tipo de banco de 64 KB. Sustituye la comparación de punteros a
/// funciones `put` por un discriminante explícito.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BankKind {
    Rom,
    Flash,
    Sram,
    Dram,
    /// Registros mapeados en memoria (DragonBall)
    Registers,
    /// Memoria del host mapeada explícitamente
    Mapped,
    Unmapped,
}

/// Contrato UNIFICADO para el Bus (Memoria + bancos).
pub trait MemoryBus {
    // --- Métodos Obligatorios (Memoria) ---
    fn read(&self, addr: u32) -> u8;
    fn write(&mut self, addr: u32, val: u8);

    // --- Despacho por bancos ---
    fn bank_kind(&self, _addr: u32) -> BankKind {
        BankKind::Unmapped
    }

    /// `ValidAddress` del banco que contiene `addr`.
    fn valid_address(&self, _addr: u32, _size: u32) -> bool {
        false
    }

    /// Traducción a memoria real del host, si el rango es contiguo.
    fn real_slice(&self, _addr: u32, _len: u32) -> Option<&[u8]> {
        None
    }

    // --- Instrumentación de accesos ---
    // Anidables: cada suspend necesita su resume.
    fn suspend_access_checks(&self) {}
    fn resume_access_checks(&self) {}

    // --- Helpers Automáticos (Big Endian, Motorola 68k) ---

    fn read_u16(&self, addr: u32) -> u16 {
        let hi = self.read(addr) as u16;
        let lo = self.read(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    fn read_u32(&self, addr: u32) -> u32 {
        let hi = self.read_u16(addr) as u32;
        let lo = self.read_u16(addr.wrapping_add(2)) as u32;
        (hi << 16) | lo
    }

    fn write_u16(&mut self, addr: u32, val: u16) {
        self.write(addr, (val >> 8) as u8);
        self.write(addr.wrapping_add(1), (val & 0xFF) as u8);
    }

    fn write_u32(&mut self, addr: u32, val: u32) {
        self.write_u16(addr, (val >> 16) as u16);
        self.write_u16(addr.wrapping_add(2), (val & 0xFFFF) as u16);
    }
}

// ============================================================================
//  HOOKS DEL INTÉRPRETE
// ============================================================================

/// Resultado de un hook: si lo consumió, el intérprete no ejecuta el
/// camino por defecto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Handled,
    NotHandled,
}

impl HookOutcome {
    pub fn handled(self) -> bool {
        self == HookOutcome::Handled
    }
}

/// Cómo cambió A7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpChange {
    /// Cambio drástico: cambio de pila (MOVE a A7, MOVEA, etc.)
    Assignment,
    /// Push / LINK / JSR
    Decrement,
    /// Pop / UNLK / RTS
    Increment,
    /// Re-validación tras el parche de la pila del kernel
    KernelStackHack,
}

/// Puntos de enganche que el intérprete invoca en cada evento.
pub trait CpuHooks {
    type Error;

    /// Excepción TRAP de llamada al sistema. El PC apunta a la palabra
    /// que sigue al opcode.
    fn on_system_call(
        &mut self,
        cpu: &mut dyn Cpu,
        bus: &mut dyn MemoryBus,
    ) -> Result<HookOutcome, Self::Error>;

    fn on_jsr(
        &mut self,
        cpu: &mut dyn Cpu,
        bus: &mut dyn MemoryBus,
        old_pc: u32,
        dest: u32,
    ) -> Result<HookOutcome, Self::Error>;

    fn on_jsr_indirect(
        &mut self,
        cpu: &mut dyn Cpu,
        bus: &mut dyn MemoryBus,
        old_pc: u32,
        dest: u32,
    ) -> Result<HookOutcome, Self::Error>;

    fn on_link(
        &mut self,
        cpu: &mut dyn Cpu,
        bus: &mut dyn MemoryBus,
        displacement: i16,
    ) -> Result<HookOutcome, Self::Error>;

    fn on_rts(
        &mut self,
        cpu: &mut dyn Cpu,
        bus: &mut dyn MemoryBus,
        dest: u32,
    ) -> Result<HookOutcome, Self::Error>;

    fn on_rte(
        &mut self,
        cpu: &mut dyn Cpu,
        bus: &mut dyn MemoryBus,
        dest: u32,
    ) -> Result<HookOutcome, Self::Error>;

    fn on_new_pc(&mut self, bus: &dyn MemoryBus, dest: u32) -> Result<(), Self::Error>;

    fn on_new_sp(
        &mut self,
        cpu: &dyn Cpu,
        bus: &dyn MemoryBus,
        change: SpChange,
    ) -> Result<(), Self::Error>;
}

// ============================================================================
//  ROM LOADER (UTILIDAD)
// ============================================================================

#[derive(Error, Debug)]
pub enum RomError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ROM file is too small or empty")]
    Empty,
    #[error("ROM size {0} is not a multiple of 2")]
    OddSize(usize),
}

pub struct Rom {
    pub data: Vec<u8>,
}

impl Rom {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RomError> {
        Self::from_bytes(fs::read(path)?)
    }

    /// Una imagen 68k debe estar alineada a palabra.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, RomError> {
        if data.is_empty() {
            return Err(RomError::Empty);
        }
        if data.len() % 2 != 0 {
            return Err(RomError::OddSize(data.len()));
        }
        Ok(Self { data })
    }

    /// Crea una ROM vacía de tamaño fijo (útil para tests)
    pub fn new_empty(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestBus {
        ram: Vec<u8>,
    }
    impl MemoryBus for TestBus {
        fn read(&self, addr: u32) -> u8 {
            self.ram[addr as usize]
        }
        fn write(&mut self, addr: u32, val: u8) {
            self.ram[addr as usize] = val;
        }
    }

    #[test]
    fn test_big_endian_helpers() {
        let mut bus = TestBus { ram: vec![0; 16] };
        bus.write_u32(4, 0x414D_5800);
        assert_eq!(&bus.ram[4..8], &[0x41, 0x4D, 0x58, 0x00]);
        assert_eq!(bus.read_u32(4), 0x414D_5800);
        assert_eq!(bus.read_u16(6), 0x5800);

        bus.write_u16(0, 0xA0B2);
        assert_eq!(bus.read(0), 0xA0);
        assert_eq!(bus.read(1), 0xB2);
    }

    #[test]
    fn test_default_bank_is_unmapped() {
        let bus = TestBus { ram: vec![0; 4] };
        assert_eq!(bus.bank_kind(0), BankKind::Unmapped);
        assert!(!bus.valid_address(0, 2));
        assert!(bus.real_slice(0, 2).is_none());
    }

    #[test]
    fn test_rom_rejects_bad_images() {
        assert!(matches!(Rom::from_bytes(Vec::new()), Err(RomError::Empty)));
        assert!(matches!(Rom::from_bytes(vec![0; 3]), Err(RomError::OddSize(3))));
        assert_eq!(Rom::from_bytes(vec![0; 4]).map(|r| r.len()).ok(), Some(4));
    }
}
