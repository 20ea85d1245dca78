/// The CPU's view of the rest of the machine: a 16-bit address space with a read, a write,
/// and an idle bus cycle that does neither (used for cycles the real hardware spends without
/// touching memory, e.g. internal ALU operations).
pub trait BusInterface {
    fn read(&mut self, address: u16) -> u8;

    fn write(&mut self, address: u16, value: u8);

    fn idle(&mut self);
}
